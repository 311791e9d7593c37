use crate::types::*;

pub const METHOD: &str = ":method";
pub const SCHEME: &str = ":scheme";
pub const PATH: &str = ":path";
pub const AUTHORITY: &str = ":authority";
pub const STATUS: &str = ":status";

/// An ordered header list with key multiplicity, as decoded from or fed to
/// the HPACK codec. Iteration preserves insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    /// All values for `name`, in insertion order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[must_use]
    pub fn get_one(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Builds a header list from decoded HPACK fields. Non-UTF-8 names or
    /// values are malformed at this layer.
    pub fn from_decoded(fields: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Self, ProtocolError> {
        let mut headers = Self {
            fields: Vec::with_capacity(fields.len()),
        };
        for (name, value) in fields {
            let name = String::from_utf8(name).map_err(|_| {
                ProtocolError::stream(ErrorType::ProtocolError, "header name is not valid UTF-8")
            })?;
            let value = String::from_utf8(value).map_err(|_| {
                ProtocolError::stream(ErrorType::ProtocolError, "header value is not valid UTF-8")
            })?;
            headers.fields.push((name, value));
        }
        Ok(headers)
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

fn malformed(message: &'static str) -> ProtocolError {
    ProtocolError::stream(ErrorType::ProtocolError, message)
}

/// Whether a header block carries a request or a response. A server receives
/// requests, a client receives responses; PUSH_PROMISE blocks are always
/// request-shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDirection {
    Request,
    Response,
}

impl BlockDirection {
    #[must_use]
    pub fn receiving(role: Role) -> Self {
        match role {
            Role::Server => BlockDirection::Request,
            Role::Client => BlockDirection::Response,
        }
    }
}

/// Validates a received header block.
///
/// `block_index` counts completed header blocks on the stream before this
/// one (1 means trailers), `end_stream` is the END_STREAM flag of the frame
/// that opened the block.
///
/// https://httpwg.org/specs/rfc7540.html#HttpHeaders
pub fn validate_received_block(
    headers: &Headers,
    direction: BlockDirection,
    block_index: u32,
    end_stream: bool,
) -> Result<(), ProtocolError> {
    if block_index >= 2 {
        return Err(malformed("more than two header blocks on one stream"));
    }
    let trailers = block_index == 1;
    if trailers && !end_stream {
        return Err(malformed("trailers without END_STREAM"));
    }

    let mut seen_regular = false;
    for (name, value) in headers.iter() {
        if name.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(malformed("header name is not lower case"));
        }
        if let Some(pseudo) = name.strip_prefix(':') {
            if seen_regular {
                return Err(malformed("pseudo-header after a regular header"));
            }
            if trailers {
                return Err(malformed("pseudo-header in trailers"));
            }
            let allowed = match direction {
                BlockDirection::Request => {
                    matches!(pseudo, "method" | "scheme" | "path" | "authority")
                }
                BlockDirection::Response => pseudo == "status",
            };
            if !allowed {
                return Err(malformed("pseudo-header not allowed in this direction"));
            }
        } else {
            seen_regular = true;
            if name == "connection" {
                return Err(malformed("connection-specific header field"));
            }
            if name == "te" && value != "trailers" {
                return Err(malformed("te header with a value other than trailers"));
            }
        }
    }

    if trailers {
        return Ok(());
    }

    match direction {
        BlockDirection::Request => {
            let methods = headers.get_all(METHOD);
            if methods.len() != 1 {
                return Err(malformed("request must have exactly one :method"));
            }
            let schemes = headers.get_all(SCHEME);
            let paths = headers.get_all(PATH);
            if methods[0] == "CONNECT" {
                if !schemes.is_empty() || !paths.is_empty() {
                    return Err(malformed("CONNECT request with :scheme or :path"));
                }
            } else {
                if schemes.len() != 1 {
                    return Err(malformed("request must have exactly one :scheme"));
                }
                if paths.len() != 1 {
                    return Err(malformed("request must have exactly one :path"));
                }
                if matches!(schemes[0], "http" | "https") && paths[0].is_empty() {
                    return Err(malformed("empty :path for http or https request"));
                }
            }
        }
        BlockDirection::Response => {
            if headers.get_all(STATUS).len() != 1 {
                return Err(malformed("response must have exactly one :status"));
            }
        }
    }

    Ok(())
}
