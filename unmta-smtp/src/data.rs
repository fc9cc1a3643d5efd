//! DATA payload consumption with dot-transparency (RFC 5321 Section 4.5.2).
//!
//! Octets are consumed until CRLF `.` CRLF at a line boundary. Lines that
//! begin with a dot have the leading dot stripped; CRLF line endings are
//! preserved. Bytes arriving after the terminator (pipelined commands) are
//! handed back untouched.

/// Outcome of feeding one chunk of octets into the decoder.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DataOutcome {
    /// Terminator not seen yet; keep reading.
    Continue,
    /// The accumulated payload exceeded the configured maximum size.
    Overflow,
    /// Terminator seen: the unstuffed payload plus any trailing raw octets.
    Complete {
        payload: Vec<u8>,
        remainder: Vec<u8>,
    },
}

/// Accumulates the raw DATA stream and detects the end-of-data marker across
/// chunk boundaries.
pub(crate) struct DataDecoder {
    raw: Vec<u8>,
    /// Maximum payload size in bytes; 0 means unlimited.
    limit: usize,
}

impl DataDecoder {
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            raw: Vec::new(),
            limit,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> DataOutcome {
        // Terminator detection must look back across the chunk boundary
        let scan_from = self.raw.len().saturating_sub(4);
        self.raw.extend_from_slice(chunk);

        if let Some(end) = self.find_terminator(scan_from) {
            let remainder = self.raw.split_off(end.after);
            self.raw.truncate(end.body_len);
            return DataOutcome::Complete {
                payload: unstuff(&self.raw),
                remainder,
            };
        }

        if self.limit > 0 && self.raw.len() > self.limit + TERMINATOR.len() {
            return DataOutcome::Overflow;
        }

        DataOutcome::Continue
    }
}

const TERMINATOR: &[u8] = b"\r\n.\r\n";

struct TerminatorAt {
    /// Length of the body, final CRLF included.
    body_len: usize,
    /// Offset of the first octet after the terminator.
    after: usize,
}

impl DataDecoder {
    fn find_terminator(&self, scan_from: usize) -> Option<TerminatorAt> {
        // A payload that is empty altogether: the first line is the dot
        if self.raw.starts_with(b".\r\n") {
            return Some(TerminatorAt {
                body_len: 0,
                after: 3,
            });
        }

        let haystack = &self.raw[scan_from..];
        haystack
            .windows(TERMINATOR.len())
            .position(|window| window == TERMINATOR)
            .map(|pos| {
                let at = scan_from + pos;
                TerminatorAt {
                    // The terminator's leading CRLF ends the last body line
                    body_len: at + 2,
                    after: at + TERMINATOR.len(),
                }
            })
    }
}

/// Remove the transparency dot from every line that starts with one.
fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut at_line_start = true;

    for &byte in body {
        if at_line_start && byte == b'.' {
            at_line_start = false;
            continue;
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }

    out
}
