//! Recovery of the secret bundle from initialization output
//!
//! The initialization script prints a YAML block between two marker lines.
//! The last start marker and the last end marker delimit the block so that
//! markers echoed earlier in log noise are ignored. A complete earlier marker
//! pair means the script emitted two blocks, which is rejected.

use serde_yaml::Value;

use crate::bundle::{RECOVERY_SHARES, SecretBundle};
use crate::error::ExtractionError;

/// Line preceding the token block
pub const START_MARKER: &str = "--START TOKENS--";

/// Line following the token block
pub const END_MARKER: &str = "--END TOKENS--";

/// Extract the bundle from combined script output
///
/// # Errors
/// Returns an `ExtractionError` describing the first problem found. No
/// partial bundle is ever returned.
pub fn extract_bundle(output: &str) -> Result<SecretBundle, ExtractionError> {
    let start = output
        .rfind(START_MARKER)
        .ok_or(ExtractionError::MissingStartMarker)?;
    let end = output
        .rfind(END_MARKER)
        .ok_or(ExtractionError::MissingEndMarker)?;
    if end < start {
        return Err(ExtractionError::EndBeforeStart);
    }

    let before = &output[..start];
    if let Some(earlier_start) = before.find(START_MARKER)
        && before[earlier_start..].contains(END_MARKER)
    {
        return Err(ExtractionError::AmbiguousMarkers);
    }

    parse_block(&output[start + START_MARKER.len()..end])
}

fn parse_block(block: &str) -> Result<SecretBundle, ExtractionError> {
    // Only the location is kept; the parser message may quote the block
    let value: Value = serde_yaml::from_str(block).map_err(|e| {
        let location = e.location();
        ExtractionError::Malformed {
            line: location.as_ref().map(serde_yaml::Location::line),
            column: location.as_ref().map(serde_yaml::Location::column),
        }
    })?;
    let Value::Mapping(mapping) = value else {
        return Err(ExtractionError::NotAMapping);
    };

    let root_token = match mapping.get("root_token") {
        Some(Value::String(token)) => token.clone(),
        _ => return Err(ExtractionError::MissingRootToken),
    };
    if root_token.trim().is_empty() {
        return Err(ExtractionError::EmptyRootToken);
    }

    let Some(Value::Sequence(shares)) = mapping.get("recovery_keys") else {
        return Err(ExtractionError::MissingRecoveryKeys);
    };
    if shares.len() != RECOVERY_SHARES {
        return Err(ExtractionError::WrongShareCount {
            expected: RECOVERY_SHARES,
            found: shares.len(),
        });
    }

    let mut recovery_keys: [String; RECOVERY_SHARES] = Default::default();
    for (i, (slot, share)) in recovery_keys.iter_mut().zip(shares).enumerate() {
        let Value::String(share) = share else {
            return Err(ExtractionError::InvalidShare { index: i + 1 });
        };
        if share.trim().is_empty() {
            return Err(ExtractionError::EmptyShare { index: i + 1 });
        }
        slot.clone_from(share);
    }

    SecretBundle::new(root_token, recovery_keys).ok_or(ExtractionError::EmptyRootToken)
}
