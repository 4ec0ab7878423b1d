use http::Method;

use rime_types::{InvalidNameError, PackageName};

/// What to do with an incoming request.
#[derive(Debug)]
pub(crate) enum Disposition {
    /// `GET /-/health`: answer locally, never contact upstream.
    Health,
    /// Forward verbatim: non-GET methods and anything carrying the `/-/`
    /// sentinel segment (tarballs, search, dist-tag management, login).
    Passthrough,
    /// A metadata lookup for the named package.
    Metadata(PackageName),
    /// A metadata-shaped path that does not decode to a valid package name.
    Invalid(InvalidNameError),
}

pub(crate) fn classify(method: &Method, path: &str) -> Disposition {
    if method == Method::GET && path == "/-/health" {
        return Disposition::Health;
    }
    if method != Method::GET {
        return Disposition::Passthrough;
    }
    if path.contains("/-/") {
        return Disposition::Passthrough;
    }
    match PackageName::from_uri_path(path) {
        Ok(name) => Disposition::Metadata(name),
        Err(err) => Disposition::Invalid(err),
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::{classify, Disposition};

    #[test]
    fn health_probe() {
        assert!(matches!(
            classify(&Method::GET, "/-/health"),
            Disposition::Health
        ));
        // Only as a GET; anything else forwards.
        assert!(matches!(
            classify(&Method::POST, "/-/health"),
            Disposition::Passthrough
        ));
    }

    #[test]
    fn non_get_methods_forward() {
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
            assert!(matches!(
                classify(&method, "/express"),
                Disposition::Passthrough
            ));
        }
    }

    #[test]
    fn sentinel_paths_forward() {
        for path in [
            "/express/-/express-4.18.0.tgz",
            "/-/v1/search?text=express",
            "/-/npm/v1/user",
            "/@scope%2fname/-/name-1.0.0.tgz",
        ] {
            assert!(matches!(
                classify(&Method::GET, path),
                Disposition::Passthrough
            ));
        }
    }

    #[test]
    fn metadata_lookups() {
        match classify(&Method::GET, "/express") {
            Disposition::Metadata(name) => assert_eq!(name.as_str(), "express"),
            other => panic!("unexpected disposition: {other:?}"),
        }
        match classify(&Method::GET, "/@types%2Fnode") {
            Disposition::Metadata(name) => assert_eq!(name.as_str(), "@types/node"),
            other => panic!("unexpected disposition: {other:?}"),
        }
    }

    #[test]
    fn invalid_names_are_flagged() {
        assert!(matches!(
            classify(&Method::GET, "/%2e%2e"),
            Disposition::Invalid(_)
        ));
        assert!(matches!(classify(&Method::GET, "/"), Disposition::Invalid(_)));
    }
}
