//! Connectionless ("out-of-band") packets and command-line tokenizing.
//!
//! An out-of-band packet starts with four `0xFF` bytes followed by a single
//! line of text such as `getchallenge` or `connect "\name\Player"`. The same
//! tokenizer splits reliable client commands once they arrive over a channel.

pub const OOB_MARKER: [u8; 4] = [0xFF; 4];

/// Longest token kept; longer tokens are truncated
const MAX_TOKEN_CHARS: usize = 1024;
/// Arguments past this count are ignored
const MAX_STRING_TOKENS: usize = 1024;

pub fn is_connectionless(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == OOB_MARKER
}

/// Builds an out-of-band datagram carrying `text`
pub fn encode(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + text.len());
    out.extend_from_slice(&OOB_MARKER);
    out.extend_from_slice(text.as_bytes());
    out
}

/// Builds an out-of-band `print` reply
pub fn print(text: &str) -> Vec<u8> {
    encode(&format!("print\n{}", text))
}

/// Text following the marker, or `None` for sequenced packets
pub fn payload(data: &[u8]) -> Option<String> {
    if !is_connectionless(data) {
        return None;
    }
    Some(String::from_utf8_lossy(&data[4..]).into_owned())
}

/// A tokenized command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    argv: Vec<String>,
}

impl CommandArgs {
    /// Splits `text` on whitespace, honouring double quotes and stopping at `//`.
    pub fn tokenize(text: &str) -> Self {
        let bytes = text.as_bytes();
        let mut argv = Vec::new();
        let mut i = 0;

        while i < bytes.len() && argv.len() < MAX_STRING_TOKENS {
            // skip whitespace and control characters
            while i < bytes.len() && bytes[i] <= b' ' {
                i += 1;
            }
            if i >= bytes.len() {
                break;
            }

            if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'/') {
                break;
            }
            if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                continue;
            }

            let start;
            let end;
            if bytes[i] == b'"' {
                i += 1;
                start = i;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
                end = i;
                i = (i + 1).min(bytes.len());
            } else {
                start = i;
                while i < bytes.len() && bytes[i] > b' ' && bytes[i] != b'"' {
                    if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'/') {
                        break;
                    }
                    i += 1;
                }
                end = i;
            }

            let mut token = String::from_utf8_lossy(&bytes[start..end]).into_owned();
            if token.len() > MAX_TOKEN_CHARS {
                let mut cut = MAX_TOKEN_CHARS;
                while !token.is_char_boundary(cut) {
                    cut -= 1;
                }
                token.truncate(cut);
            }
            argv.push(token);
        }

        Self { argv }
    }

    pub fn argc(&self) -> usize {
        self.argv.len()
    }

    /// Token `index`, or an empty string past the end
    pub fn argv(&self, index: usize) -> &str {
        self.argv.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn command(&self) -> &str {
        self.argv(0)
    }

    /// Tokens from `index` onwards joined by single spaces
    pub fn args_from(&self, index: usize) -> String {
        self.argv.get(index..).map(|rest| rest.join(" ")).unwrap_or_default()
    }

    pub fn args(&self) -> String {
        self.args_from(1)
    }
}
