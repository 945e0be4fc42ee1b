//! In-process update client.
//!
//! Plays both ends of a push: the client builds the `BEGIN` line from the
//! node's challenge, the node side runs the real [`PushSession`] into an
//! in-memory sink. The steps the node would report are returned for the
//! simulated update service to hand to the cycle.

use node_core::update::protocol::{
    ImageSink, PushHeader, PushSession, SinkError, auth_token, image_digest, parse_challenge,
};
use node_core::update::{ImageKind, UpdateError, UpdateStep};
use rand_core::RngCore;

/// Inactive application slot size on the reference partition table.
pub const APP_SLOT_BYTES: u32 = 0x14_0000;
/// Data partition size on the reference partition table.
pub const FS_PARTITION_BYTES: u32 = 0x16_0000;
const CHUNK_LEN: usize = 1024;

#[derive(Default)]
pub struct MemorySink {
    staged: Vec<u8>,
    target: Option<ImageKind>,
    installed: Vec<(ImageKind, usize)>,
}

impl MemorySink {
    pub fn installed(&self) -> &[(ImageKind, usize)] {
        &self.installed
    }
}

impl ImageSink for MemorySink {
    fn begin(&mut self, kind: ImageKind, size: u32) -> Result<(), SinkError> {
        let capacity = match kind {
            ImageKind::Application => APP_SLOT_BYTES,
            ImageKind::Filesystem => FS_PARTITION_BYTES,
        };
        if size > capacity {
            return Err(SinkError::NoSpace);
        }
        self.staged.clear();
        self.target = Some(kind);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        if self.target.is_none() {
            return Err(SinkError::Io);
        }
        self.staged.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let kind = self.target.take().ok_or(SinkError::Io)?;
        self.installed.push((kind, self.staged.len()));
        self.staged.clear();
        Ok(())
    }

    fn abort(&mut self) {
        self.target = None;
        self.staged.clear();
    }
}

/// Pushes a generated image of `size` bytes, authenticating with
/// `client_password` against a node that expects `node_password`.
pub fn push<R: RngCore>(
    sink: &mut MemorySink,
    rng: &mut R,
    kind: ImageKind,
    size: u32,
    client_password: &str,
    node_password: &str,
) -> Vec<UpdateStep> {
    let mut nonce = [0u8; node_core::update::protocol::NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let mut session = PushSession::new(sink, nonce, node_password);

    let Ok(seen) = parse_challenge(&session.challenge()) else {
        return vec![UpdateStep::Failed(UpdateError::Connect)];
    };
    let mut image = vec![0u8; usize::try_from(size).unwrap_or(usize::MAX)];
    rng.fill_bytes(&mut image);
    let header = PushHeader {
        kind,
        size,
        digest: image_digest(&image),
        auth: auth_token(&seen, client_password),
    };
    let Ok(line) = header.to_line() else {
        return vec![UpdateStep::Failed(UpdateError::Begin)];
    };

    let mut steps = Vec::new();
    match session.accept_header(&line) {
        Ok(accepted) => steps.push(UpdateStep::Started {
            kind: accepted.kind,
            size: accepted.size,
        }),
        Err(error) => {
            steps.push(UpdateStep::Failed(error));
            return steps;
        }
    }
    for chunk in image.chunks(CHUNK_LEN) {
        match session.receive(chunk) {
            Ok(progress) => steps.push(UpdateStep::Progress {
                received: progress.received,
                total: progress.total,
            }),
            Err(error) => {
                session.abort();
                steps.push(UpdateStep::Failed(error));
                return steps;
            }
        }
    }
    steps.push(match session.finish() {
        Ok(kind) => UpdateStep::Completed(kind),
        Err(error) => UpdateStep::Failed(error),
    });
    steps
}
