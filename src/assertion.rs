//! Assertion Codec
//!
//! Assertions are typed, line-oriented text records carrying a detached
//! signature. The wire layout is:
//!
//! ```text
//! type: serial
//! authority-id: acme
//! device-key:
//!     AcbBTQRWhcGAARAAtJGI...
//!     ...
//! body-length: 12
//! sign-key-sha3-384: Jv8_JiHiIzJVcO9M55pPdqSDWUvuhfDIBJUS-3VW7F_idjix7Ffn5qMxB21ZQuij
//!
//! serial: A123
//!
//! AcLBUgQAAQoABgUCV...
//! ```
//!
//! The signed *content* is the header block, followed by a blank line and the
//! body when one is present. The signature follows after one more blank line.
//! Streams hold several assertions separated by a blank line and are read
//! lazily with [`Decoder`].

use crate::openpgp::{OpenPgpError, RsaPrivateKey, RsaPublicKey};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::io::BufRead;

/// Media type of encoded assertions on the wire
pub const MEDIA_TYPE: &str = "application/x.ubuntu.assertion";

const MAX_HEADERS_SIZE: usize = 128 * 1024; // 128 KiB
const MAX_BODY_SIZE: usize = 2 * 1024 * 1024; // 2 MiB
const MULTILINE_INDENT: &str = "    ";

pub const HEADER_TYPE: &str = "type";
pub const HEADER_AUTHORITY_ID: &str = "authority-id";
pub const HEADER_BODY_LENGTH: &str = "body-length";
pub const HEADER_SIGN_KEY: &str = "sign-key-sha3-384";

#[derive(Debug, thiserror::Error)]
pub enum AssertionError {
    #[error("malformed assertion: {0}")]
    Malformed(String),

    #[error("unknown assertion type {0:?}")]
    UnknownType(String),

    #[error("{assertion_type} assertion is missing header {header:?}")]
    MissingHeader {
        assertion_type: AssertionType,
        header: &'static str,
    },

    #[error("signature key mismatch: assertion names {expected}, key is {actual}")]
    KeyMismatch { expected: String, actual: String },

    #[error(transparent)]
    Signature(#[from] OpenPgpError),

    #[error("failed to read assertion stream: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AssertionError>;

fn malformed(message: impl Into<String>) -> AssertionError {
    AssertionError::Malformed(message.into())
}

/// Assertion variants understood by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssertionType {
    SerialRequest,
    Model,
    Serial,
    AccountKeyRequest,
}

impl AssertionType {
    pub fn name(&self) -> &'static str {
        match self {
            AssertionType::SerialRequest => "serial-request",
            AssertionType::Model => "model",
            AssertionType::Serial => "serial",
            AssertionType::AccountKeyRequest => "account-key-request",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "serial-request" => Some(AssertionType::SerialRequest),
            "model" => Some(AssertionType::Model),
            "serial" => Some(AssertionType::Serial),
            "account-key-request" => Some(AssertionType::AccountKeyRequest),
            _ => None,
        }
    }

    fn required_headers(&self) -> &'static [&'static str] {
        match self {
            AssertionType::SerialRequest => &["brand-id", "model", "device-key", "request-id"],
            AssertionType::Model => &[
                HEADER_AUTHORITY_ID,
                "series",
                "brand-id",
                "model",
                "architecture",
                "gadget",
                "kernel",
                "timestamp",
            ],
            AssertionType::Serial => &[
                HEADER_AUTHORITY_ID,
                "brand-id",
                "model",
                "serial",
                "device-key",
                "device-key-sha3-384",
                "timestamp",
            ],
            AssertionType::AccountKeyRequest => {
                &["account-id", "name", "public-key-sha3-384", "since"]
            }
        }
    }
}

impl fmt::Display for AssertionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered header map; keys are unique and keep their insertion position
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing the value in place when the key already exists
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let position = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(position).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `type`, then `authority-id`, then everything else in insertion order
    fn canonical_order(&self) -> Vec<(&str, &str)> {
        let mut ordered = Vec::with_capacity(self.0.len());
        for first in [HEADER_TYPE, HEADER_AUTHORITY_ID] {
            if let Some(value) = self.get(first) {
                ordered.push((first, value));
            }
        }
        ordered.extend(
            self.iter()
                .filter(|(k, _)| *k != HEADER_TYPE && *k != HEADER_AUTHORITY_ID),
        );
        ordered
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (key, value) in iter {
            headers.set(key, value);
        }
        headers
    }
}

/// A decoded or freshly signed assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    assertion_type: AssertionType,
    headers: Headers,
    body: Vec<u8>,
    content: Vec<u8>,
    signature: Vec<u8>,
}

impl Assertion {
    /// Sign as an authority: `authority-id` must be present
    pub fn sign(
        assertion_type: AssertionType,
        headers: Headers,
        body: Vec<u8>,
        key: &RsaPrivateKey,
    ) -> Result<Self> {
        let has_authority = headers
            .get(HEADER_AUTHORITY_ID)
            .is_some_and(|v| !v.is_empty());
        if !has_authority {
            return Err(AssertionError::MissingHeader {
                assertion_type,
                header: HEADER_AUTHORITY_ID,
            });
        }
        Self::sign_with(assertion_type, headers, body, key)
    }

    /// Self-signed assertion, as produced by a device for a serial-request
    pub fn sign_without_authority(
        assertion_type: AssertionType,
        headers: Headers,
        body: Vec<u8>,
        key: &RsaPrivateKey,
    ) -> Result<Self> {
        Self::sign_with(assertion_type, headers, body, key)
    }

    fn sign_with(
        assertion_type: AssertionType,
        mut headers: Headers,
        body: Vec<u8>,
        key: &RsaPrivateKey,
    ) -> Result<Self> {
        headers.set(HEADER_TYPE, assertion_type.name());
        headers.set(HEADER_SIGN_KEY, key.public_key().id());
        if body.is_empty() {
            headers.remove(HEADER_BODY_LENGTH);
        } else {
            headers.set(HEADER_BODY_LENGTH, body.len().to_string());
        }

        let content = encode_content(&headers, &body)?;
        let signature = key.sign(&content)?;
        // Re-read the content so the headers carry the exact decoded form
        let headers = parse_headers(header_block(&content, &body)?)?;
        Self::from_parts(headers, body, content, signature)
    }

    fn from_parts(
        headers: Headers,
        body: Vec<u8>,
        content: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<Self> {
        let type_name = headers
            .get(HEADER_TYPE)
            .ok_or_else(|| malformed("assertion has no type header"))?;
        let assertion_type = AssertionType::from_name(type_name)
            .ok_or_else(|| AssertionError::UnknownType(type_name.to_string()))?;

        let required = assertion_type
            .required_headers()
            .iter()
            .chain(std::iter::once(&HEADER_SIGN_KEY));
        for header in required {
            if headers.get(header).map_or(true, str::is_empty) {
                return Err(AssertionError::MissingHeader {
                    assertion_type,
                    header: *header,
                });
            }
        }

        Ok(Self {
            assertion_type,
            headers,
            body,
            content,
            signature,
        })
    }

    pub fn assertion_type(&self) -> AssertionType {
        self.assertion_type
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The signed bytes: header block plus the body when present
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn sign_key_id(&self) -> &str {
        self.headers.get(HEADER_SIGN_KEY).unwrap_or_default()
    }

    /// Parse the `device-key` header
    pub fn device_key(&self) -> Result<RsaPublicKey> {
        let text = self
            .headers
            .get("device-key")
            .ok_or_else(|| malformed("assertion carries no device-key"))?;
        Ok(RsaPublicKey::from_base64(text)?)
    }

    /// Check the signature and that `key` is the one named by `sign-key-sha3-384`
    pub fn verify(&self, key: &RsaPublicKey) -> Result<()> {
        if key.id() != self.sign_key_id() {
            return Err(AssertionError::KeyMismatch {
                expected: self.sign_key_id().to_string(),
                actual: key.id().to_string(),
            });
        }
        key.verify(&self.content, &self.signature)?;
        Ok(())
    }

    /// Canonical wire form: content, a blank line, then the signature
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.content.clone();
        out.extend_from_slice(b"\n\n");
        out.extend_from_slice(STANDARD.encode(&self.signature).as_bytes());
        out
    }
}

/// Encode several assertions as one stream
pub fn encode_stream(assertions: &[Assertion]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, assertion) in assertions.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(b"\n\n");
        }
        out.extend_from_slice(&assertion.encode());
    }
    if !out.is_empty() {
        out.push(b'\n');
    }
    out
}

fn valid_key(key: &str) -> bool {
    key.starts_with(|c: char| c.is_ascii_lowercase())
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn encode_content(headers: &Headers, body: &[u8]) -> Result<Vec<u8>> {
    let mut text = String::new();
    for (i, (key, value)) in headers.canonical_order().into_iter().enumerate() {
        if !valid_key(key) {
            return Err(malformed(format!("invalid header name {:?}", key)));
        }
        if i > 0 {
            text.push('\n');
        }
        text.push_str(key);
        text.push(':');
        if value.contains('\n') {
            if value.starts_with(' ') {
                return Err(malformed(format!(
                    "multi-line header {:?} cannot start with a space",
                    key
                )));
            }
            for line in value.split('\n') {
                text.push('\n');
                text.push_str(MULTILINE_INDENT);
                text.push_str(line);
            }
        } else {
            text.push(' ');
            text.push_str(value);
        }
    }

    let mut content = text.into_bytes();
    if !body.is_empty() {
        content.extend_from_slice(b"\n\n");
        content.extend_from_slice(body);
    }
    Ok(content)
}

fn header_block<'a>(content: &'a [u8], body: &[u8]) -> Result<&'a str> {
    let len = if body.is_empty() {
        content.len()
    } else {
        content.len() - body.len() - 2
    };
    std::str::from_utf8(&content[..len]).map_err(|_| malformed("headers are not valid UTF-8"))
}

/// Whitespace-strict header parser: exactly one space follows the colon of
/// an inline value; an empty remainder opens an indented multi-line block.
fn parse_headers(text: &str) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut lines = text.split('\n').peekable();

    while let Some(line) = lines.next() {
        if line.starts_with(' ') {
            return Err(malformed(format!("unexpected continuation line {:?}", line)));
        }
        let (key, rest) = line
            .split_once(':')
            .ok_or_else(|| malformed(format!("header line without colon: {:?}", line)))?;
        if !valid_key(key) {
            return Err(malformed(format!("invalid header name {:?}", key)));
        }
        if headers.get(key).is_some() {
            return Err(malformed(format!("repeated header {:?}", key)));
        }

        let value = if rest.is_empty() {
            let first = lines
                .next_if(|l| l.starts_with(' '))
                .ok_or_else(|| malformed(format!("header {:?} has no value", key)))?;
            let indent = &first[..first.len() - first.trim_start_matches(' ').len()];
            let mut value = first[indent.len()..].to_string();
            while let Some(next) = lines.next_if(|l| l.starts_with(' ')) {
                let stripped = next.strip_prefix(indent).ok_or_else(|| {
                    malformed(format!("inconsistent indentation in header {:?}", key))
                })?;
                value.push('\n');
                value.push_str(stripped);
            }
            value
        } else {
            let mut value = rest
                .strip_prefix(' ')
                .ok_or_else(|| malformed(format!("header {:?} needs one space after colon", key)))?
                .to_string();
            // Inline values continue on lines starting with a single space
            while let Some(next) = lines.next_if(|l| l.starts_with(' ')) {
                value.push('\n');
                value.push_str(&next[1..]);
            }
            value
        };
        headers.set(key, value);
    }
    Ok(headers)
}

/// Lazy decoder over a stream of assertions
pub struct Decoder<R> {
    reader: R,
    finished: bool,
}

/// Decode every assertion in `reader`, one at a time
pub fn decode_stream<R: BufRead>(reader: R) -> Decoder<R> {
    Decoder::new(reader)
}

/// Decode exactly one assertion
pub fn decode(data: &[u8]) -> Result<Assertion> {
    let mut decoder = Decoder::new(data);
    let assertion = decoder
        .next()
        .ok_or_else(|| malformed("no assertion in input"))??;
    if decoder.next().is_some() {
        return Err(malformed("unexpected data after assertion"));
    }
    Ok(assertion)
}

impl<R: BufRead> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
        }
    }

    /// Read one line without its newline; `None` at end of stream
    fn read_line(&mut self) -> Result<Option<(Vec<u8>, bool)>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        let terminated = line.last() == Some(&b'\n');
        if terminated {
            line.pop();
        }
        Ok(Some((line, terminated)))
    }

    fn read_assertion(&mut self) -> Result<Option<Assertion>> {
        let mut header_bytes: Vec<u8> = Vec::new();
        loop {
            let Some((line, terminated)) = self.read_line()? else {
                if header_bytes.is_empty() {
                    return Ok(None);
                }
                return Err(malformed("stream ended inside the header block"));
            };
            if header_bytes.is_empty() && line.iter().all(u8::is_ascii_whitespace) {
                // Blank lines between or after assertions
                continue;
            }
            if line.is_empty() {
                break;
            }
            if !header_bytes.is_empty() {
                header_bytes.push(b'\n');
            }
            header_bytes.extend_from_slice(&line);
            if !terminated {
                return Err(malformed("stream ended inside the header block"));
            }
            if header_bytes.len() > MAX_HEADERS_SIZE {
                return Err(malformed("header block too large"));
            }
        }

        let header_text =
            std::str::from_utf8(&header_bytes).map_err(|_| malformed("headers are not valid UTF-8"))?;
        let headers = parse_headers(header_text)?;

        let body_length = match headers.get(HEADER_BODY_LENGTH) {
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| malformed(format!("invalid body-length {:?}", value)))?,
            None => 0,
        };
        if body_length > MAX_BODY_SIZE {
            return Err(malformed("body too large"));
        }

        let mut content = header_bytes;
        let mut body = vec![0u8; body_length];
        if body_length > 0 {
            self.reader
                .read_exact(&mut body)
                .map_err(|_| malformed("stream ended inside the body"))?;
            let mut separator = [0u8; 2];
            self.reader
                .read_exact(&mut separator)
                .map_err(|_| malformed("missing separator after body"))?;
            if &separator != b"\n\n" {
                return Err(malformed("body must be followed by a blank line"));
            }
            content.extend_from_slice(b"\n\n");
            content.extend_from_slice(&body);
        }

        let mut signature_text = String::new();
        while let Some((line, _)) = self.read_line()? {
            if line.is_empty() {
                break;
            }
            let line = std::str::from_utf8(&line).map_err(|_| malformed("invalid signature"))?;
            signature_text.push_str(line.trim());
        }
        if signature_text.is_empty() {
            return Err(malformed("missing signature"));
        }
        let signature = STANDARD
            .decode(signature_text.as_bytes())
            .map_err(|e| malformed(format!("invalid signature encoding: {}", e)))?;

        Assertion::from_parts(headers, body, content, signature).map(Some)
    }
}

impl<R: BufRead> Iterator for Decoder<R> {
    type Item = Result<Assertion>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_assertion() {
            Ok(Some(assertion)) => Some(Ok(assertion)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Builds the self-signed serial-request a device sends during provisioning
///
/// ```no_run
/// use serial_vault::assertion::SerialRequestBuilder;
/// use serial_vault::openpgp::RsaPrivateKey;
///
/// let device_key = RsaPrivateKey::generate(2048)?;
/// let request = SerialRequestBuilder::new("acme", "alder", "nonce-from-server")
///     .serial("A123")
///     .build(&device_key)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SerialRequestBuilder {
    brand_id: String,
    model: String,
    request_id: String,
    serial: Option<String>,
    body: Vec<u8>,
}

impl SerialRequestBuilder {
    pub fn new(brand_id: &str, model: &str, request_id: &str) -> Self {
        Self {
            brand_id: brand_id.to_string(),
            model: model.to_string(),
            request_id: request_id.to_string(),
            serial: None,
            body: Vec::new(),
        }
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    pub fn body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    pub fn build(self, device_key: &RsaPrivateKey) -> Result<Assertion> {
        let mut headers = Headers::new();
        headers.set("brand-id", self.brand_id);
        headers.set("model", self.model);
        if let Some(serial) = self.serial.filter(|s| !s.is_empty()) {
            headers.set("serial", serial);
        }
        headers.set("device-key", device_key.public_key().to_base64_wrapped());
        headers.set("request-id", self.request_id);
        Assertion::sign_without_authority(
            AssertionType::SerialRequest,
            headers,
            self.body,
            device_key,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::generate(2048).unwrap())
    }

    fn model_headers(model: &str) -> Headers {
        [
            ("authority-id", "acme"),
            ("series", "16"),
            ("brand-id", "acme"),
            ("model", model),
            ("architecture", "amd64"),
            ("gadget", "pc"),
            ("kernel", "pc-kernel"),
            ("timestamp", "2026-01-01T00:00:00Z"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_canonical_header_order() {
        let mut headers = Headers::new();
        headers.set("brand-id", "acme");
        headers.set("authority-id", "acme");
        headers.set("model", "alder");
        headers.set("type", "model");
        let content = encode_content(&headers, b"").unwrap();
        assert_eq!(
            String::from_utf8(content).unwrap(),
            "type: model\nauthority-id: acme\nbrand-id: acme\nmodel: alder"
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = test_key();
        let mut headers = model_headers("alder");
        headers.set("store", "brand-store\nsecond-line");
        let signed = Assertion::sign(
            AssertionType::Model,
            headers,
            b"body text\nwith lines".to_vec(),
            key,
        )
        .unwrap();

        let encoded = signed.encode();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, signed);
        assert_eq!(decoded.encode(), encoded);
        assert_eq!(decoded.header("store"), Some("brand-store\nsecond-line"));
        assert_eq!(decoded.header("body-length"), Some("20"));
        assert_eq!(decoded.body(), b"body text\nwith lines");
        decoded.verify(key.public_key()).unwrap();
    }

    #[test]
    fn test_sign_requires_authority() {
        let mut headers = model_headers("alder");
        headers.remove("authority-id");
        let result = Assertion::sign(AssertionType::Model, headers, Vec::new(), test_key());
        assert!(matches!(
            result,
            Err(AssertionError::MissingHeader {
                header: "authority-id",
                ..
            })
        ));
    }

    #[test]
    fn test_strict_colon_spacing() {
        assert!(parse_headers("type:serial").is_err());
        assert!(parse_headers("type : serial").is_err());
        let headers = parse_headers("type:  serial").unwrap();
        assert_eq!(headers.get("type"), Some(" serial"));
    }

    #[test]
    fn test_multiline_indentation_is_stripped() {
        let headers = parse_headers("device-key:\n    abc\n    def\ntype: serial").unwrap();
        assert_eq!(headers.get("device-key"), Some("abc\ndef"));
        assert_eq!(headers.get("type"), Some("serial"));

        assert!(parse_headers("device-key:\n    abc\n  def").is_err());
        assert!(parse_headers("device-key:\ntype: serial").is_err());
    }

    #[test]
    fn test_repeated_and_invalid_headers() {
        assert!(parse_headers("type: a\ntype: b").is_err());
        assert!(parse_headers("Type: a").is_err());
        assert!(parse_headers("no colon here").is_err());
    }

    #[test]
    fn test_stream_with_two_assertions_and_wrapped_signature() {
        let key = test_key();
        let request = SerialRequestBuilder::new("acme", "alder", "abc")
            .serial("A1")
            .build(key)
            .unwrap();
        let model =
            Assertion::sign(AssertionType::Model, model_headers("alder"), Vec::new(), key).unwrap();

        // Wrap the first signature over several lines
        let mut first = request.content().to_vec();
        first.extend_from_slice(b"\n\n");
        let signature = STANDARD.encode(request.signature());
        for chunk in signature.as_bytes().chunks(72) {
            first.extend_from_slice(chunk);
            first.push(b'\n');
        }
        first.push(b'\n');
        first.extend_from_slice(&model.encode());

        let decoded: Vec<Assertion> = decode_stream(first.as_slice())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], request);
        assert_eq!(decoded[1].assertion_type(), AssertionType::Model);

        let stream = encode_stream(&decoded);
        assert_eq!(decode_stream(stream.as_slice()).count(), 2);
    }

    #[test]
    fn test_empty_stream() {
        assert_eq!(decode_stream(&b""[..]).count(), 0);
        assert_eq!(decode_stream(&b"\n\n"[..]).count(), 0);
    }

    #[test]
    fn test_trailing_blank_lines_are_ignored() {
        let key = test_key();
        let model =
            Assertion::sign(AssertionType::Model, model_headers("alder"), Vec::new(), key).unwrap();

        let mut padded = model.encode();
        padded.extend_from_slice(b"\n\n  \n\t\r\n\n");
        assert_eq!(decode(&padded).unwrap(), model);

        let mut stream = encode_stream(&[model.clone(), model.clone()]);
        stream.extend_from_slice(b"\n \n\n");
        assert_eq!(decode_stream(stream.as_slice()).count(), 2);
        assert!(decode_stream(stream.as_slice()).all(|a| a.is_ok()));
    }

    #[test]
    fn test_unknown_type_and_missing_headers() {
        let result = decode(b"type: snap-declaration\nsign-key-sha3-384: x\n\nAAAA");
        assert!(matches!(result, Err(AssertionError::UnknownType(_))));

        let result = decode(b"type: serial-request\nsign-key-sha3-384: x\n\nAAAA");
        assert!(matches!(result, Err(AssertionError::MissingHeader { .. })));
    }

    #[test]
    fn test_truncated_inputs() {
        assert!(decode(b"type: serial-request").is_err());
        assert!(decode(b"type: serial-request\nbody-length: 10\n\nshort").is_err());
        assert!(decode(b"type: serial-request\n\n").is_err());
    }

    #[test]
    fn test_serial_request_builder() {
        let key = test_key();
        let request = SerialRequestBuilder::new("acme", "alder", "nonce")
            .body(b"serial: A777")
            .build(key)
            .unwrap();
        assert_eq!(request.assertion_type(), AssertionType::SerialRequest);
        assert_eq!(request.header("serial"), None);
        assert_eq!(request.header("authority-id"), None);
        assert_eq!(request.sign_key_id(), key.public_key().id());
        assert_eq!(request.device_key().unwrap(), *key.public_key());
        request.verify(&request.device_key().unwrap()).unwrap();
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let request = SerialRequestBuilder::new("acme", "alder", "nonce")
            .build(test_key())
            .unwrap();
        let other = RsaPrivateKey::generate(2048).unwrap();
        assert!(matches!(
            request.verify(other.public_key()),
            Err(AssertionError::KeyMismatch { .. })
        ));
    }
}
