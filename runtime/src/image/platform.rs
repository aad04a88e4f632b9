use imgflow_core::error::{ImageError, Result};
use imgflow_core::platform::PlatformSpec;
use oci_spec::image::ImageConfiguration;

/// Compare the platform an image config declares with the requested one.
///
/// Empty requested fields default to the host. A mismatch is advisory and
/// returned as a message; only a config that cannot be parsed is an error.
pub fn check_platform(config: &[u8], requested: &PlatformSpec) -> Result<Option<String>> {
    let config: ImageConfiguration = serde_json::from_slice(config).map_err(|e| {
        ImageError::Serialization(format!("failed to parse image platform: {}", e))
    })?;
    let actual = PlatformSpec::new(
        config.os().to_string(),
        config.architecture().to_string(),
        config.variant().clone().unwrap_or_default(),
    )
    .normalized();
    let wanted = requested.clone().or(&PlatformSpec::host()).normalized();

    let matches = actual.os == wanted.os
        && actual.architecture == wanted.architecture
        && (wanted.variant.is_empty() || actual.variant == wanted.variant);
    if matches {
        return Ok(None);
    }
    Ok(Some(format!(
        "image platform ({}) does not match the expected platform ({})",
        actual, wanted
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(os: &str, arch: &str, variant: Option<&str>) -> Vec<u8> {
        let mut value = serde_json::json!({
            "os": os,
            "architecture": arch,
            "rootfs": { "type": "layers", "diff_ids": [] }
        });
        if let Some(variant) = variant {
            value["variant"] = variant.into();
        }
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_match() {
        let requested = PlatformSpec::new("linux", "amd64", "");
        assert_eq!(check_platform(&config("linux", "amd64", None), &requested).unwrap(), None);
    }

    #[test]
    fn test_aliases_compare_equal() {
        let requested = PlatformSpec::new("linux", "aarch64", "");
        assert_eq!(
            check_platform(&config("linux", "arm64", Some("v8")), &requested).unwrap(),
            None
        );
        let requested = PlatformSpec::new("linux", "arm", "v7");
        assert_eq!(check_platform(&config("linux", "arm", None), &requested).unwrap(), None);
    }

    #[test]
    fn test_mismatch_is_advisory() {
        let requested = PlatformSpec::new("linux", "arm64", "");
        let message = check_platform(&config("linux", "amd64", None), &requested)
            .unwrap()
            .unwrap();
        assert_eq!(
            message,
            "image platform (linux/amd64) does not match the expected platform (linux/arm64)"
        );
    }

    #[test]
    fn test_variant_mismatch() {
        let requested = PlatformSpec::new("linux", "arm", "v6");
        assert!(check_platform(&config("linux", "arm", Some("v7")), &requested)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_empty_request_uses_host() {
        let host = PlatformSpec::host();
        let cfg = config(&host.os, &host.architecture, None);
        assert_eq!(check_platform(&cfg, &PlatformSpec::default()).unwrap(), None);
    }

    #[test]
    fn test_malformed_config_is_fatal() {
        assert!(check_platform(b"not json", &PlatformSpec::default()).is_err());
    }
}
