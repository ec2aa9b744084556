//! Incremental extraction of JSON values from a byte stream, so responses
//! like the changes feed or a revs-diff result can be consumed row by row
//! without buffering the whole collection.

use std::collections::VecDeque;

/// Scans a JSON byte stream for complete objects whose opening brace occurs
/// at a configured nesting depth, optionally together with the object key
/// they are the value of.
///
/// Depth counts every open `{` or `[`. For `{"results":[{row}..]}` the rows
/// open at depth 2; for `{"id": {entry}, ..}` the entries open at depth 1
/// and carry keys.
pub struct JsonItems {
    item_depth: usize,
    with_keys: bool,

    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Bytes of the object currently being captured, if any.
    capture: Option<Vec<u8>>,
    /// Raw bytes (including quotes) of the most recent complete string seen
    /// one level above `item_depth`.
    last_key: Option<Vec<u8>>,
    /// String currently being read, used for key tracking.
    pending_string: Option<Vec<u8>>,
    items: VecDeque<(Option<String>, Vec<u8>)>,
    error: bool,
}

impl JsonItems {
    /// Scanner for array items: objects opening at `item_depth`.
    pub fn items_at(item_depth: usize) -> Self {
        Self::new(item_depth, false)
    }

    /// Scanner for the entries of a top-level object, reporting their keys.
    pub fn object_entries() -> Self {
        Self::new(1, true)
    }

    fn new(item_depth: usize, with_keys: bool) -> Self {
        Self {
            item_depth,
            with_keys,
            depth: 0,
            in_string: false,
            escaped: false,
            capture: None,
            last_key: None,
            pending_string: None,
            items: VecDeque::new(),
            error: false,
        }
    }

    /// Feeds more input. Completed items become available via
    /// [`JsonItems::next_item`].
    pub fn feed(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            self.advance(byte);
        }
    }

    /// The next completed `(key, raw json)` pair, if any.
    pub fn next_item(&mut self) -> Option<(Option<String>, Vec<u8>)> {
        self.items.pop_front()
    }

    /// Whether the input could not be a valid stream for this scanner.
    pub fn is_malformed(&self) -> bool {
        self.error
    }

    fn advance(&mut self, byte: u8) {
        if let Some(capture) = &mut self.capture {
            capture.push(byte);
        }

        if self.in_string {
            if let Some(pending) = &mut self.pending_string {
                pending.push(byte);
            }
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
                if let Some(pending) = self.pending_string.take() {
                    self.last_key = Some(pending);
                }
            }
            return;
        }

        match byte {
            b'"' => {
                self.in_string = true;
                if self.with_keys && self.depth == self.item_depth && self.capture.is_none() {
                    self.pending_string = Some(vec![b'"']);
                }
            }
            b'{' => {
                if self.depth == self.item_depth && self.capture.is_none() {
                    self.capture = Some(vec![b'{']);
                }
                self.depth += 1;
            }
            b'[' => {
                self.depth += 1;
            }
            b'}' | b']' => {
                if self.depth == 0 {
                    self.error = true;
                    return;
                }
                self.depth -= 1;

                if byte == b'}' && self.depth == self.item_depth {
                    if let Some(raw) = self.capture.take() {
                        let key = match self.last_key.take() {
                            Some(raw_key) if self.with_keys => {
                                serde_json::from_slice(&raw_key).ok()
                            }
                            _ => None,
                        };
                        self.items.push_back((key, raw));
                    }
                }
            }
            _ => (),
        }
    }
}
