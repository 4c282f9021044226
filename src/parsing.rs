/// Normalizes a port publication list the way the container backends expect
/// it: a bare integer `n` becomes `n:n`, entries that already carry a `:` are
/// kept as-is, empty entries are dropped, and duplicates are discarded
/// preserving the first occurrence. Idempotent.
///
///```
/// use docker_commander::normalize_ports;
///
/// let ports = ["80", "443:443", "8080:80", "80"].map(str::to_owned);
/// let normalized = normalize_ports(&ports);
/// assert_eq!(normalized, ["80:80", "443:443", "8080:80"]);
/// assert_eq!(normalize_ports(&normalized), normalized);
/// ```
pub fn normalize_ports(ports: &[String]) -> Vec<String> {
    let mut out: Vec<String> = vec![];
    for port in ports {
        let port = port.trim();
        if port.is_empty() {
            continue
        }
        let normalized = if port.contains(':') {
            port.to_owned()
        } else {
            format!("{port}:{port}")
        };
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}

/// Joins an image name and optional version into the reference passed to
/// docker, `name` or `name:version`
///
///```
/// use docker_commander::image_ref;
///
/// assert_eq!(image_ref("postgres", Some("16")), "postgres:16");
/// assert_eq!(image_ref("postgres", None), "postgres");
/// ```
pub fn image_ref(image: &str, version: Option<&str>) -> String {
    match version {
        Some(version) if !version.is_empty() => format!("{image}:{version}"),
        _ => image.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_integers_map_to_both_sides() {
        let ports = ["5432".to_owned()];
        assert_eq!(normalize_ports(&ports), ["5432:5432"]);
    }

    #[test]
    fn explicit_pairs_and_partial_forms_are_kept() {
        let ports = ["127.0.0.1:8000:8000".to_owned(), ":80".to_owned()];
        assert_eq!(normalize_ports(&ports), ["127.0.0.1:8000:8000", ":80"]);
    }

    #[test]
    fn duplicates_collapse_after_normalization() {
        let ports = ["80".to_owned(), "80:80".to_owned(), "80".to_owned()];
        assert_eq!(normalize_ports(&ports), ["80:80"]);
    }

    #[test]
    fn empty_entries_are_dropped() {
        let ports = ["".to_owned(), " ".to_owned(), "80".to_owned()];
        assert_eq!(normalize_ports(&ports), ["80:80"]);
    }
}
