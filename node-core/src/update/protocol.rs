//! Password-gated push-update protocol, transport independent.
//!
//! ```text
//! node   -> CHALLENGE <nonce, 32 hex>
//! client -> BEGIN <app|fs> <size> <sha256 of image, 64 hex> <auth, 64 hex>
//! node   -> OK | ERR <reason>
//! client -> <size bytes>
//! node   -> OK | ERR <reason>
//! ```
//!
//! `auth` is `SHA-256(<nonce hex> ":" <password>)`.

use core::fmt::{self, Write as _};

use heapless::String;
use sha2::{Digest, Sha256};
use winnow::ascii::{dec_uint, space1};
use winnow::combinator::alt;
use winnow::prelude::*;
use winnow::stream::AsChar;
use winnow::token::take_while;

use super::{ImageKind, UpdateError};

pub const NONCE_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;
/// Longest line either side sends.
pub const MAX_LINE: usize = 160;

pub type Line = String<MAX_LINE>;

/// Malformed protocol lines.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtocolError {
    Malformed,
    /// Line did not fit in [`MAX_LINE`].
    Overlong,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed => f.write_str("malformed line"),
            ProtocolError::Overlong => f.write_str("line too long"),
        }
    }
}

/// Storage failures reported by an [`ImageSink`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SinkError {
    NoSpace,
    Io,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::NoSpace => f.write_str("image does not fit"),
            SinkError::Io => f.write_str("storage i/o error"),
        }
    }
}

/// Destination for a received image.
pub trait ImageSink {
    /// Prepares storage for `size` bytes.
    ///
    /// # Errors
    ///
    /// When the target partition cannot hold the image.
    fn begin(&mut self, kind: ImageKind, size: u32) -> Result<(), SinkError>;

    /// # Errors
    ///
    /// Storage write failures.
    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError>;

    /// Makes the image the one used on next boot.
    ///
    /// # Errors
    ///
    /// When the image cannot be activated.
    fn finish(&mut self) -> Result<(), SinkError>;

    /// Discards a partial image.
    fn abort(&mut self);
}

impl<T: ImageSink + ?Sized> ImageSink for &mut T {
    fn begin(&mut self, kind: ImageKind, size: u32) -> Result<(), SinkError> {
        (**self).begin(kind, size)
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        (**self).write(chunk)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        (**self).finish()
    }

    fn abort(&mut self) {
        (**self).abort();
    }
}

/// Parsed `BEGIN` line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PushHeader {
    pub kind: ImageKind,
    pub size: u32,
    pub digest: [u8; DIGEST_LEN],
    pub auth: [u8; DIGEST_LEN],
}

impl PushHeader {
    /// Client side: renders the `BEGIN` line, newline included.
    ///
    /// # Errors
    ///
    /// Never in practice; the line is shorter than [`MAX_LINE`].
    pub fn to_line(&self) -> Result<Line, ProtocolError> {
        let mut line = Line::new();
        let kind = match self.kind {
            ImageKind::Application => "app",
            ImageKind::Filesystem => "fs",
        };
        write!(line, "BEGIN {kind} {} ", self.size).map_err(|_| ProtocolError::Overlong)?;
        push_hex(&mut line, &self.digest)?;
        line.push(' ').map_err(|_| ProtocolError::Overlong)?;
        push_hex(&mut line, &self.auth)?;
        line.push('\n').map_err(|_| ProtocolError::Overlong)?;
        Ok(line)
    }
}

fn push_hex(line: &mut Line, bytes: &[u8]) -> Result<(), ProtocolError> {
    for byte in bytes {
        write!(line, "{byte:02x}").map_err(|_| ProtocolError::Overlong)?;
    }
    Ok(())
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

fn decode_hex<const N: usize>(text: &str) -> Option<[u8; N]> {
    let bytes = text.as_bytes();
    if bytes.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    for (slot, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *slot = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
    }
    Some(out)
}

fn image_kind(input: &mut &str) -> ModalResult<ImageKind> {
    alt((
        "app".value(ImageKind::Application),
        "fs".value(ImageKind::Filesystem),
    ))
    .parse_next(input)
}

fn hex_digest(input: &mut &str) -> ModalResult<[u8; DIGEST_LEN]> {
    take_while(DIGEST_LEN * 2, AsChar::is_hex_digit)
        .verify_map(decode_hex::<DIGEST_LEN>)
        .parse_next(input)
}

fn begin_line(input: &mut &str) -> ModalResult<PushHeader> {
    "BEGIN".parse_next(input)?;
    space1.parse_next(input)?;
    let kind = image_kind.parse_next(input)?;
    space1.parse_next(input)?;
    let size: u32 = dec_uint.parse_next(input)?;
    space1.parse_next(input)?;
    let digest = hex_digest.parse_next(input)?;
    space1.parse_next(input)?;
    let auth = hex_digest.parse_next(input)?;
    Ok(PushHeader {
        kind,
        size,
        digest,
        auth,
    })
}

fn challenge_line(input: &mut &str) -> ModalResult<[u8; NONCE_LEN]> {
    "CHALLENGE".parse_next(input)?;
    space1.parse_next(input)?;
    take_while(NONCE_LEN * 2, AsChar::is_hex_digit)
        .verify_map(decode_hex::<NONCE_LEN>)
        .parse_next(input)
}

/// Parses a `BEGIN` line. Trailing whitespace is ignored.
///
/// # Errors
///
/// [`ProtocolError::Malformed`] for anything else.
pub fn parse_header(line: &str) -> Result<PushHeader, ProtocolError> {
    begin_line
        .parse(line.trim_end())
        .map_err(|_| ProtocolError::Malformed)
}

/// Client side: extracts the nonce from a `CHALLENGE` line.
///
/// # Errors
///
/// [`ProtocolError::Malformed`] when the line is not a challenge.
pub fn parse_challenge(line: &str) -> Result<[u8; NONCE_LEN], ProtocolError> {
    challenge_line
        .parse(line.trim_end())
        .map_err(|_| ProtocolError::Malformed)
}

/// `SHA-256(<nonce hex> ":" <password>)`.
#[must_use]
pub fn auth_token(nonce: &[u8; NONCE_LEN], password: &str) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    for byte in nonce {
        let pair = [HEX[usize::from(byte >> 4)], HEX[usize::from(byte & 0x0F)]];
        hasher.update(pair);
    }
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Digest a client announces for an image.
#[must_use]
pub fn image_digest(image: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(image).into()
}

/// Reply line for a protocol step.
pub const fn reply(result: Result<(), UpdateError>) -> &'static str {
    match result {
        Ok(()) => "OK\n",
        Err(UpdateError::Connect) => "ERR connect\n",
        Err(UpdateError::Auth) => "ERR auth\n",
        Err(UpdateError::Begin) => "ERR begin\n",
        Err(UpdateError::Receive) => "ERR receive\n",
        Err(UpdateError::End) => "ERR end\n",
    }
}

/// Byte count after a [`PushSession::receive`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransferProgress {
    pub received: u32,
    pub total: u32,
}

impl TransferProgress {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.received >= self.total
    }
}

enum Phase {
    AwaitingHeader,
    Receiving {
        kind: ImageKind,
        size: u32,
        received: u32,
        digest: [u8; DIGEST_LEN],
        hasher: Sha256,
    },
    Complete,
    Failed,
}

/// Node side of one push, from challenge to verified image.
pub struct PushSession<'a, S> {
    sink: S,
    nonce: [u8; NONCE_LEN],
    password: &'a str,
    phase: Phase,
}

impl<'a, S: ImageSink> PushSession<'a, S> {
    #[must_use]
    pub fn new(sink: S, nonce: [u8; NONCE_LEN], password: &'a str) -> Self {
        Self {
            sink,
            nonce,
            password,
            phase: Phase::AwaitingHeader,
        }
    }

    /// The `CHALLENGE` line, newline included.
    #[must_use]
    pub fn challenge(&self) -> Line {
        let mut line = Line::new();
        // 43 bytes; always fits.
        let _ = line.push_str("CHALLENGE ");
        let _ = push_hex(&mut line, &self.nonce);
        let _ = line.push('\n');
        line
    }

    /// Validates the `BEGIN` line and opens the sink.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Auth`] on a bad token, [`UpdateError::Begin`] for a
    /// malformed header, an empty image or a sink that cannot take it.
    pub fn accept_header(&mut self, line: &str) -> Result<PushHeader, UpdateError> {
        if !matches!(self.phase, Phase::AwaitingHeader) {
            return Err(self.fail(UpdateError::Begin));
        }
        let header = parse_header(line).map_err(|_| self.fail(UpdateError::Begin))?;

        let expected = auth_token(&self.nonce, self.password);
        if !digests_match(&expected, &header.auth) {
            return Err(self.fail(UpdateError::Auth));
        }
        if header.size == 0 {
            return Err(self.fail(UpdateError::Begin));
        }
        if self.sink.begin(header.kind, header.size).is_err() {
            return Err(self.fail(UpdateError::Begin));
        }

        self.phase = Phase::Receiving {
            kind: header.kind,
            size: header.size,
            received: 0,
            digest: header.digest,
            hasher: Sha256::new(),
        };
        Ok(header)
    }

    /// Feeds image bytes.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Receive`] when data arrives out of phase, overruns the
    /// announced size, or cannot be stored.
    pub fn receive(&mut self, chunk: &[u8]) -> Result<TransferProgress, UpdateError> {
        let Phase::Receiving {
            size,
            received,
            hasher,
            ..
        } = &mut self.phase
        else {
            return Err(self.fail(UpdateError::Receive));
        };

        let Ok(len) = u32::try_from(chunk.len()) else {
            return Err(self.fail(UpdateError::Receive));
        };
        let total = *size;
        let Some(next) = received.checked_add(len).filter(|next| *next <= total) else {
            return Err(self.fail(UpdateError::Receive));
        };

        hasher.update(chunk);
        *received = next;
        if self.sink.write(chunk).is_err() {
            return Err(self.fail(UpdateError::Receive));
        }
        Ok(TransferProgress {
            received: next,
            total,
        })
    }

    /// Verifies the digest and activates the image.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Receive`] when bytes are missing, [`UpdateError::End`]
    /// on a digest mismatch or when the sink refuses to activate.
    pub fn finish(&mut self) -> Result<ImageKind, UpdateError> {
        let phase = core::mem::replace(&mut self.phase, Phase::Failed);
        let Phase::Receiving {
            kind,
            size,
            received,
            digest,
            hasher,
        } = phase
        else {
            return Err(self.fail(UpdateError::End));
        };

        let verdict = if received != size {
            Err(UpdateError::Receive)
        } else {
            let actual: [u8; DIGEST_LEN] = hasher.finalize().into();
            if !digests_match(&actual, &digest) {
                Err(UpdateError::End)
            } else if self.sink.finish().is_err() {
                Err(UpdateError::End)
            } else {
                Ok(kind)
            }
        };

        match verdict {
            Ok(_) => self.phase = Phase::Complete,
            // Phase is already Failed; the sink still holds the partial image.
            Err(_) => self.sink.abort(),
        }
        verdict
    }

    /// Abandons the transfer, discarding any partial image.
    pub fn abort(&mut self) {
        if matches!(self.phase, Phase::Receiving { .. }) {
            self.sink.abort();
        }
        self.phase = Phase::Failed;
    }

    #[must_use]
    pub fn is_receiving(&self) -> bool {
        matches!(self.phase, Phase::Receiving { .. })
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete)
    }

    #[must_use]
    pub fn into_sink(self) -> S {
        self.sink
    }

    fn fail(&mut self, error: UpdateError) -> UpdateError {
        self.abort();
        error
    }
}

fn digests_match(a: &[u8; DIGEST_LEN], b: &[u8; DIGEST_LEN]) -> bool {
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemorySink {
        data: heapless::Vec<u8, 64>,
        begun: Option<(ImageKind, u32)>,
        finished: bool,
        aborted: bool,
        capacity: u32,
    }

    impl ImageSink for MemorySink {
        fn begin(&mut self, kind: ImageKind, size: u32) -> Result<(), SinkError> {
            if size > self.capacity {
                return Err(SinkError::NoSpace);
            }
            self.begun = Some((kind, size));
            Ok(())
        }

        fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
            self.data
                .extend_from_slice(chunk)
                .map_err(|_| SinkError::NoSpace)
        }

        fn finish(&mut self) -> Result<(), SinkError> {
            self.finished = true;
            Ok(())
        }

        fn abort(&mut self) {
            self.aborted = true;
        }
    }

    const NONCE: [u8; NONCE_LEN] = [0xA5; NONCE_LEN];
    const PASSWORD: &str = "pw0123";
    const IMAGE: &[u8] = b"firmware image bytes";

    fn sink() -> MemorySink {
        MemorySink {
            capacity: 64,
            ..MemorySink::default()
        }
    }

    fn header(kind: ImageKind, password: &str) -> Line {
        PushHeader {
            kind,
            size: u32::try_from(IMAGE.len()).unwrap(),
            digest: image_digest(IMAGE),
            auth: auth_token(&NONCE, password),
        }
        .to_line()
        .unwrap()
    }

    #[test]
    fn challenge_round_trips_through_client_parser() {
        let mut sink = sink();
        let session = PushSession::new(&mut sink, NONCE, PASSWORD);
        let line = session.challenge();
        assert!(line.starts_with("CHALLENGE a5a5"));
        assert_eq!(parse_challenge(&line), Ok(NONCE));
    }

    #[test]
    fn full_transfer_verifies_and_finishes() {
        let mut sink = sink();
        let mut session = PushSession::new(&mut sink, NONCE, PASSWORD);

        let accepted = session
            .accept_header(&header(ImageKind::Application, PASSWORD))
            .unwrap();
        assert_eq!(accepted.kind, ImageKind::Application);

        let (first, rest) = IMAGE.split_at(8);
        assert!(!session.receive(first).unwrap().is_complete());
        assert!(session.receive(rest).unwrap().is_complete());
        assert_eq!(session.finish(), Ok(ImageKind::Application));
        assert!(session.is_complete());

        assert!(sink.finished);
        assert_eq!(sink.data.as_slice(), IMAGE);
        assert_eq!(sink.begun, Some((ImageKind::Application, 20)));
    }

    #[test]
    fn wrong_password_is_auth_failure() {
        let mut sink = sink();
        let mut session = PushSession::new(&mut sink, NONCE, PASSWORD);
        assert_eq!(
            session.accept_header(&header(ImageKind::Filesystem, "guess")),
            Err(UpdateError::Auth)
        );
        assert!(sink.begun.is_none());
    }

    #[test]
    fn malformed_header_is_begin_failure() {
        let mut sink = sink();
        let mut session = PushSession::new(&mut sink, NONCE, PASSWORD);
        assert_eq!(
            session.accept_header("BEGIN exe 10 00 00"),
            Err(UpdateError::Begin)
        );
    }

    #[test]
    fn oversized_image_is_begin_failure() {
        let mut sink = MemorySink {
            capacity: 4,
            ..MemorySink::default()
        };
        let mut session = PushSession::new(&mut sink, NONCE, PASSWORD);
        assert_eq!(
            session.accept_header(&header(ImageKind::Application, PASSWORD)),
            Err(UpdateError::Begin)
        );
    }

    #[test]
    fn overrun_is_receive_failure_and_aborts() {
        let mut sink = sink();
        let mut session = PushSession::new(&mut sink, NONCE, PASSWORD);
        session
            .accept_header(&header(ImageKind::Application, PASSWORD))
            .unwrap();
        session.receive(IMAGE).unwrap();
        assert_eq!(session.receive(b"x"), Err(UpdateError::Receive));
        assert!(!session.is_receiving());
        assert!(sink.aborted);
    }

    #[test]
    fn corrupted_image_is_end_failure() {
        let mut sink = sink();
        let mut session = PushSession::new(&mut sink, NONCE, PASSWORD);
        session
            .accept_header(&header(ImageKind::Application, PASSWORD))
            .unwrap();
        let mut corrupted = [0u8; 20];
        corrupted.copy_from_slice(IMAGE);
        corrupted[3] ^= 0xFF;
        session.receive(&corrupted).unwrap();
        assert_eq!(session.finish(), Err(UpdateError::End));
        assert!(!sink.finished);
    }

    #[test]
    fn short_transfer_is_receive_failure() {
        let mut sink = sink();
        let mut session = PushSession::new(&mut sink, NONCE, PASSWORD);
        session
            .accept_header(&header(ImageKind::Application, PASSWORD))
            .unwrap();
        session.receive(&IMAGE[..5]).unwrap();
        assert_eq!(session.finish(), Err(UpdateError::Receive));
    }

    #[test]
    fn replies_name_the_phase() {
        assert_eq!(reply(Ok(())), "OK\n");
        assert_eq!(reply(Err(UpdateError::Auth)), "ERR auth\n");
    }

    #[test]
    fn header_parser_accepts_trailing_crlf() {
        let mut line = header(ImageKind::Filesystem, PASSWORD);
        line.pop();
        line.push_str("\r\n").unwrap();
        let parsed = parse_header(&line).unwrap();
        assert_eq!(parsed.kind, ImageKind::Filesystem);
        assert_eq!(parsed.size, 20);
    }
}
