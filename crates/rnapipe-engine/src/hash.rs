//! Blake3 fingerprints of stage command lines

use crate::stage::Stage;

/// Fingerprint of a stage's commands, stored in the checkpoint so `status`
/// can flag stages whose command changed after completion.
pub fn fingerprint(stage: &Stage) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(stage.id.name().as_bytes());
    for command in &stage.commands {
        hasher.update(b"\0");
        hasher.update(command.render().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Return the first 8 hex characters of a fingerprint.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..8).unwrap_or(fingerprint)
}
