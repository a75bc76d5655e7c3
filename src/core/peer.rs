use anyhow::{bail, Context};
use reqwest::Url;

/// Parses the base URL of an HTTP peer.
pub fn base_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid peer URL {:?}", raw))?;
    if url.cannot_be_a_base() {
        bail!("peer URL {:?} cannot carry a path", raw);
    }

    Ok(url)
}

/// Appends `segments` to the path of `base`. Each segment is percent-encoded,
/// so ids containing `/`, `?` or `#` stay one segment.
pub fn resource(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }

    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resource_encodes_segments() {
        let base = base_url("http://127.0.0.1:6784").unwrap();

        assert_eq!(
            resource(&base, &["ip", "a/b?c"]).as_str(),
            "http://127.0.0.1:6784/ip/a%2Fb%3Fc"
        );
        assert_eq!(
            resource(&base, &["name", "c0ffee", "10.32.0.5"]).as_str(),
            "http://127.0.0.1:6784/name/c0ffee/10.32.0.5"
        );
        assert_eq!(
            resource(&base, &["ip", "x#y z"]).as_str(),
            "http://127.0.0.1:6784/ip/x%23y%20z"
        );
    }

    #[test]
    fn test_resource_keeps_base_path() {
        let slash = base_url("http://peer:6784/").unwrap();
        assert_eq!(resource(&slash, &["ip", "ep1"]).as_str(), "http://peer:6784/ip/ep1");

        let prefixed = base_url("http://peer:6784/weave/").unwrap();
        assert_eq!(
            resource(&prefixed, &["ip", "ep1"]).as_str(),
            "http://peer:6784/weave/ip/ep1"
        );

        let bare = base_url("http://peer:6784/weave").unwrap();
        assert_eq!(
            resource(&bare, &["ip", "ep1"]).as_str(),
            "http://peer:6784/weave/ip/ep1"
        );
    }

    #[test]
    fn test_base_url_rejects() {
        assert!(base_url("127.0.0.1:6784/ip").is_err());
        assert!(base_url("not a url").is_err());
        assert!(base_url("mailto:peer@example.com").is_err());
    }
}
