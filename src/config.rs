//! Environment-variable configuration loading, mirroring the teacher's `figment`-based setup.
use crate::peer_registry::PeerRegistrySnapshot;
use crate::types::{AllowedSource, CalledAe, CalledAeTitle, CallingAeTitle};
use figment::providers::Env;
use figment::Figment;
use std::collections::BTreeMap;
use std::sync::OnceLock;

static CONFIG: OnceLock<Figment> = OnceLock::new();

/// Returns the process-wide [`Figment`] sourced from `RELAY_*` environment variables.
pub fn get_config() -> &'static Figment {
    CONFIG.get_or_init(|| Figment::new().merge(Env::prefixed("RELAY_").split("_")))
}

/// Builds a bootstrap [`PeerRegistrySnapshot`] from a handful of plain `RELAY_*` environment
/// variables (§4.8: mutations come from an external control plane, out of scope; this is only
/// enough to stand up the one default AE-title processor §4.5 ships).
///
/// - `RELAY_CALLED_AE_TITLE` (default `RELAY`): the one `CalledAe` this process registers.
/// - `RELAY_CALLED_AE_NAME` (defaults to the AE title): its human-readable name.
/// - `RELAY_IGNORED_SOP_CLASSES`: comma-separated SOP Class UIDs to accept but discard.
/// - `RELAY_OVERWRITE_SAME_INSTANCE` (`true`/`false`, default `false`).
/// - `RELAY_PROCESSOR_CONFIG`: comma-separated `key=value` pairs, same shape as the teacher's
///   `OXIDICOM_PACS_ADDRESS` parsing (see `parse_string_dict`/`parse_key_value_pair`).
/// - `RELAY_ALLOWED_SOURCE`: comma-separated `aeTitle=host` pairs (§4.3 rule 2).
pub fn bootstrap_registry_from_env() -> anyhow::Result<PeerRegistrySnapshot> {
    let ae_title = std::env::var("RELAY_CALLED_AE_TITLE").unwrap_or_else(|_| "RELAY".to_string());
    let name = std::env::var("RELAY_CALLED_AE_NAME").unwrap_or_else(|_| ae_title.clone());
    let ignored_sop_classes = std::env::var("RELAY_IGNORED_SOP_CLASSES")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let overwrite_same_instance = std::env::var("RELAY_OVERWRITE_SAME_INSTANCE")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let processor_config = parse_key_value_list(&std::env::var("RELAY_PROCESSOR_CONFIG").unwrap_or_default())?
        .into_iter()
        .collect::<BTreeMap<_, _>>();
    let allowed_sources = parse_key_value_list(&std::env::var("RELAY_ALLOWED_SOURCE").unwrap_or_default())?
        .into_iter()
        .map(|(ae, host)| AllowedSource {
            ae_title: CallingAeTitle::new(ae),
            host_or_ip: host,
        })
        .collect();

    let called_ae = CalledAe {
        name,
        ae_title: CalledAeTitle::new(ae_title),
        ignored_sop_classes,
        overwrite_same_instance,
        processor_config,
    };

    Ok(PeerRegistrySnapshot::new(
        vec![called_ae],
        allowed_sources,
        Vec::new(),
    ))
}

/// Parses `"a=1,b=2"` into `[("a", "1"), ("b", "2")]`, the same shape the teacher's
/// `parse_string_dict` uses for `OXIDICOM_PACS_ADDRESS`.
fn parse_key_value_list(s: &str) -> anyhow::Result<Vec<(String, String)>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("bad key=value pair {part:?}: missing '='"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_value_list_handles_empty_and_trailing_comma() {
        assert_eq!(parse_key_value_list("").unwrap(), Vec::<(String, String)>::new());
        assert_eq!(
            parse_key_value_list("pipeline-p1=PID1,").unwrap(),
            vec![("pipeline-p1".to_string(), "PID1".to_string())]
        );
    }

    #[test]
    fn parse_key_value_list_rejects_missing_equals() {
        assert!(parse_key_value_list("bogus").is_err());
    }
}
