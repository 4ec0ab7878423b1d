use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `dist` sub-document of a version entry, reduced to the fields a
/// package manager needs to download and verify the tarball.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrimmedDist {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tarball: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shasum: Option<Value>,
}

impl TrimmedDist {
    fn from_object(dist: &Map<String, Value>) -> Self {
        Self {
            tarball: dist.get("tarball").cloned(),
            integrity: dist.get("integrity").cloned(),
            shasum: dist.get("shasum").cloned(),
        }
    }
}

/// A `dist` value as it appears in a trimmed version entry. A well-formed
/// sub-document is reduced; anything else is carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DistEntry {
    Dist(TrimmedDist),
    Verbatim(Value),
}

/// A per-version sub-document reduced to the fields that matter for
/// dependency resolution. Fields absent in the input stay absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimmedVersion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_dependencies: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_dependencies: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_dependencies_meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engines: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist: Option<DistEntry>,
}

impl TrimmedVersion {
    fn from_object(entry: &Map<String, Value>) -> Self {
        let dist = entry.get("dist").map(|dist| match dist.as_object() {
            Some(fields) => DistEntry::Dist(TrimmedDist::from_object(fields)),
            None => DistEntry::Verbatim(dist.clone()),
        });
        Self {
            name: entry.get("name").cloned(),
            version: entry.get("version").cloned(),
            dependencies: entry.get("dependencies").cloned(),
            optional_dependencies: entry.get("optionalDependencies").cloned(),
            peer_dependencies: entry.get("peerDependencies").cloned(),
            peer_dependencies_meta: entry.get("peerDependenciesMeta").cloned(),
            bin: entry.get("bin").cloned(),
            engines: entry.get("engines").cloned(),
            os: entry.get("os").cloned(),
            cpu: entry.get("cpu").cloned(),
            dist,
        }
    }
}

/// A value in the trimmed `versions` mapping. Version entries that are not
/// sub-documents are carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionEntry {
    Version(Box<TrimmedVersion>),
    Verbatim(Value),
}

/// The cache's canonical form of a metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimmedPackument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(rename = "dist-tags")]
    pub dist_tags: Value,
    pub versions: IndexMap<String, VersionEntry>,
}

/// The outcome of [`trim`]: either the canonical reduced form, or the input
/// unchanged when it is not a metadata document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Trimmed {
    Packument(TrimmedPackument),
    Verbatim(Value),
}

impl Trimmed {
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Reduce a metadata document to the fields that matter for dependency
/// resolution.
///
/// A document without both a `versions` mapping and a `dist-tags` mapping is
/// not package metadata and is returned verbatim so callers can cache it
/// unchanged. The reduction never fails: fields absent in the input stay
/// absent in the output, and `versions` keeps the input's key order.
pub fn trim(doc: &Value) -> Trimmed {
    let Some(object) = doc.as_object() else {
        return Trimmed::Verbatim(doc.clone());
    };
    let Some(versions) = object.get("versions").and_then(Value::as_object) else {
        return Trimmed::Verbatim(doc.clone());
    };
    let Some(dist_tags) = object.get("dist-tags").filter(|tags| tags.is_object()) else {
        return Trimmed::Verbatim(doc.clone());
    };

    let versions = versions
        .iter()
        .map(|(version, entry)| {
            let entry = match entry.as_object() {
                Some(fields) => VersionEntry::Version(Box::new(TrimmedVersion::from_object(fields))),
                None => VersionEntry::Verbatim(entry.clone()),
            };
            (version.clone(), entry)
        })
        .collect();

    Trimmed::Packument(TrimmedPackument {
        name: object.get("name").cloned(),
        dist_tags: dist_tags.clone(),
        versions,
    })
}

/// Parse, trim, and re-serialize a document in one step.
pub fn trim_bytes(bytes: &[u8]) -> serde_json::Result<Vec<u8>> {
    let doc: Value = serde_json::from_slice(bytes)?;
    trim(&doc).to_vec()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{trim, trim_bytes, Trimmed};

    fn trim_value(doc: &Value) -> Value {
        serde_json::to_value(trim(doc)).unwrap()
    }

    fn express() -> Value {
        json!({
            "name": "express",
            "dist-tags": { "latest": "4.18.2", "next": "5.0.0-beta.1" },
            "versions": {
                "4.18.2": {
                    "name": "express",
                    "version": "4.18.2",
                    "description": "Fast, unopinionated web framework",
                    "dependencies": { "accepts": "~1.3.8", "body-parser": "1.20.1" },
                    "devDependencies": { "mocha": "10.0.0" },
                    "peerDependenciesMeta": { "ws": { "optional": true } },
                    "scripts": { "test": "mocha" },
                    "engines": { "node": ">= 0.10.0" },
                    "dist": {
                        "tarball": "https://registry.npmjs.org/express/-/express-4.18.2.tgz",
                        "integrity": "sha512-abc",
                        "shasum": "5b0a81e",
                        "fileCount": 16,
                        "signatures": [{ "keyid": "SHA256:x" }]
                    },
                    "maintainers": [{ "name": "dougwilson" }],
                    "_npmOperationalInternal": { "host": "s3" }
                },
                "5.0.0-beta.1": {
                    "name": "express",
                    "version": "5.0.0-beta.1",
                    "dependencies": { "router": "^1.3.5" }
                }
            },
            "readme": "# Express",
            "maintainers": [{ "name": "dougwilson" }],
            "time": { "modified": "2022-10-08T20:30:32.000Z" }
        })
    }

    #[test]
    fn trim_is_idempotent() {
        let once = trim_value(&express());
        let twice = trim_value(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn version_fields_are_whitelisted() {
        const VERSION_KEYS: &[&str] = &[
            "name",
            "version",
            "dependencies",
            "optionalDependencies",
            "peerDependencies",
            "peerDependenciesMeta",
            "bin",
            "engines",
            "os",
            "cpu",
            "dist",
        ];
        const DIST_KEYS: &[&str] = &["tarball", "integrity", "shasum"];

        let trimmed = trim_value(&express());
        for entry in trimmed["versions"].as_object().unwrap().values() {
            for key in entry.as_object().unwrap().keys() {
                assert!(VERSION_KEYS.contains(&key.as_str()), "unexpected key {key}");
            }
            if let Some(dist) = entry.get("dist") {
                for key in dist.as_object().unwrap().keys() {
                    assert!(DIST_KEYS.contains(&key.as_str()), "unexpected key {key}");
                }
            }
        }
    }

    #[test]
    fn top_level_fields_are_preserved() {
        let doc = express();
        let trimmed = trim_value(&doc);
        assert_eq!(trimmed["name"], doc["name"]);
        assert_eq!(trimmed["dist-tags"], doc["dist-tags"]);
        let input_versions: Vec<&String> = doc["versions"].as_object().unwrap().keys().collect();
        let output_versions: Vec<&String> =
            trimmed["versions"].as_object().unwrap().keys().collect();
        assert_eq!(input_versions, output_versions);
    }

    #[test]
    fn version_order_survives_many_entries() {
        // An out-of-sorted-order key sequence must come back untouched.
        let doc = json!({
            "name": "ordered",
            "dist-tags": { "latest": "0.9.0" },
            "versions": {
                "2.0.0": { "version": "2.0.0" },
                "0.9.0": { "version": "0.9.0" },
                "10.0.0": { "version": "10.0.0" },
                "1.0.0": { "version": "1.0.0" }
            }
        });
        let trimmed = trim_value(&doc);
        let keys: Vec<&String> = trimmed["versions"].as_object().unwrap().keys().collect();
        assert_eq!(keys, ["2.0.0", "0.9.0", "10.0.0", "1.0.0"]);
    }

    #[test]
    fn non_metadata_documents_pass_through() {
        for doc in [
            json!({ "error": "Not found" }),
            json!({ "name": "x", "versions": { "1.0.0": {} } }),
            json!({ "name": "x", "dist-tags": { "latest": "1.0.0" } }),
            json!([1, 2, 3]),
            json!("plain string"),
        ] {
            assert_eq!(trim_value(&doc), doc);
            assert!(matches!(trim(&doc), Trimmed::Verbatim(_)));
        }
    }

    #[test]
    fn missing_dist_yields_no_dist() {
        let doc = json!({
            "name": "tiny",
            "dist-tags": { "latest": "1.0.0" },
            "versions": { "1.0.0": { "name": "tiny", "version": "1.0.0" } }
        });
        let trimmed = trim_value(&doc);
        assert!(trimmed["versions"]["1.0.0"].get("dist").is_none());
    }

    #[test]
    fn malformed_version_entries_pass_through() {
        let doc = json!({
            "name": "odd",
            "dist-tags": { "latest": "1.0.0" },
            "versions": { "1.0.0": "not an object" }
        });
        let trimmed = trim_value(&doc);
        assert_eq!(trimmed["versions"]["1.0.0"], json!("not an object"));
    }

    #[test]
    fn malformed_dist_passes_through() {
        let doc = json!({
            "name": "odd",
            "dist-tags": { "latest": "1.0.0" },
            "versions": { "1.0.0": { "version": "1.0.0", "dist": "gone" } }
        });
        let trimmed = trim_value(&doc);
        assert_eq!(trimmed["versions"]["1.0.0"]["dist"], json!("gone"));
    }

    #[test]
    fn trim_bytes_round_trips() {
        let bytes = serde_json::to_vec(&express()).unwrap();
        let trimmed: Value = serde_json::from_slice(&trim_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(trimmed, trim_value(&express()));
        assert!(trim_bytes(b"{ not json").is_err());
    }
}
