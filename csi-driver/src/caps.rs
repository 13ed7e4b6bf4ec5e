//! Volume capability negotiation.
//!
//! Pure checks of requested access modes against a volume's multi-mapping
//! setting and access type. Runtime exclusivity (who is mapped right now) is
//! enforced by the controller at publish time, not here.

use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;
use sio_client::Volume;

pub const ERR_UNKNOWN_ACCESS_MODE: &str = "access mode cannot be UNKNOWN";
pub const ERR_NO_MULTI_MAP: &str = "volume not enabled for mapping to multiple hosts";
pub const ERR_NO_MULTI_NODE_WRITER: &str =
    "multi-node with writer(s) only supported for block access type";

/// Whether any requested capability asks for raw block access.
pub fn access_type_is_block(caps: &[csi::VolumeCapability]) -> bool {
    caps.iter().any(|c| {
        matches!(
            c.access_type,
            Some(csi::volume_capability::AccessType::Block(_))
        )
    })
}

/// Validate the requested capabilities against `vol`.
///
/// Returns the first failing reason, if any.
pub fn validate(caps: &[csi::VolumeCapability], vol: &Volume) -> Result<(), &'static str> {
    let is_block = access_type_is_block(caps);

    for cap in caps {
        let Some(am) = &cap.access_mode else {
            continue;
        };

        match Mode::try_from(am.mode) {
            Ok(Mode::SingleNodeWriter) | Ok(Mode::SingleNodeReaderOnly) => {}
            Ok(Mode::MultiNodeReaderOnly) => {
                if !vol.mapping_to_all_sdcs_enabled {
                    return Err(ERR_NO_MULTI_MAP);
                }
            }
            Ok(Mode::MultiNodeSingleWriter) | Ok(Mode::MultiNodeMultiWriter) => {
                if !vol.mapping_to_all_sdcs_enabled {
                    return Err(ERR_NO_MULTI_MAP);
                }
                if !is_block {
                    return Err(ERR_NO_MULTI_NODE_WRITER);
                }
            }
            Ok(Mode::Unknown) | Err(_) => return Err(ERR_UNKNOWN_ACCESS_MODE),
        }
    }

    Ok(())
}
