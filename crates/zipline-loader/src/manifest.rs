//! Application manifests: which modules make up a guest application, where to
//! get them, what their bytes hash to, and in which order to load them.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, ManifestError, Result};

/// Manifests are stored and downloaded as `<application>.zipline.json`.
pub fn application_manifest_file_name(application_name: &str) -> String {
    format!("{application_name}.zipline.json")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineModule {
    /// Absolute, or relative to the manifest's base URL.
    pub url: String,
    #[serde(with = "hex_bytes")]
    pub sha256: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on_ids: Vec<String>,
}

impl ZiplineModule {
    pub fn new(url: impl Into<String>, sha256: impl Into<Vec<u8>>, depends_on_ids: &[&str]) -> Self {
        Self {
            url: url.into(),
            sha256: sha256.into(),
            depends_on_ids: depends_on_ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(&self.sha256)
    }
}

/// A guest application's modules in load order.
///
/// Every module appears after the modules it depends on. This holds for every
/// value of this type: [`create`](Self::create) sorts, everything else that
/// replaces the module map (including decoding) rejects an unsorted map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ManifestJson")]
pub struct ZiplineManifest {
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    signatures: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_url: Option<String>,
    main_module_id: String,
    main_function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    modules: IndexMap<String, ZiplineModule>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestJson {
    #[serde(default)]
    signatures: IndexMap<String, String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(alias = "applicationId")]
    main_module_id: String,
    #[serde(alias = "prepareFunction")]
    main_function: String,
    #[serde(default)]
    version: Option<String>,
    modules: IndexMap<String, ZiplineModule>,
}

impl TryFrom<ManifestJson> for ZiplineManifest {
    type Error = ManifestError;

    fn try_from(json: ManifestJson) -> Result<Self, ManifestError> {
        check_sorted(&json.modules)?;
        Ok(Self {
            signatures: json.signatures,
            base_url: json.base_url,
            main_module_id: json.main_module_id,
            main_function: json.main_function,
            version: json.version,
            modules: json.modules,
        })
    }
}

impl ZiplineManifest {
    /// Build a manifest, sorting `modules` so dependencies load first.
    ///
    /// Modules with no ordering constraint between them keep their input
    /// order. Fails naming every module that can't be ordered when there is a
    /// cycle or a dependency on an unknown id.
    pub fn create(
        main_module_id: impl Into<String>,
        main_function: impl Into<String>,
        modules: IndexMap<String, ZiplineModule>,
    ) -> Result<Self, ManifestError> {
        Ok(Self {
            signatures: IndexMap::new(),
            base_url: None,
            main_module_id: main_module_id.into(),
            main_function: main_function.into(),
            version: None,
            modules: sort_topologically(modules)?,
        })
    }

    /// Replace the module map. `modules` must already be in load order.
    pub fn with_modules(
        mut self,
        modules: IndexMap<String, ZiplineModule>,
    ) -> Result<Self, ManifestError> {
        check_sorted(&modules)?;
        self.modules = modules;
        Ok(self)
    }

    pub fn with_main(mut self, main_module_id: impl Into<String>, main_function: impl Into<String>) -> Self {
        self.main_module_id = main_module_id.into();
        self.main_function = main_function.into();
        self
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_signatures(mut self, signatures: IndexMap<String, String>) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn main_module_id(&self) -> &str {
        &self.main_module_id
    }

    pub fn main_function(&self) -> &str {
        &self.main_function
    }

    pub fn modules(&self) -> &IndexMap<String, ZiplineModule> {
        &self.modules
    }

    /// Key name to hex signature.
    pub fn signatures(&self) -> &IndexMap<String, String> {
        &self.signatures
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn encode_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| LoaderError::ManifestParse(e.to_string()))
    }
}

/// The bytes a manifest signature covers: the manifest JSON without its
/// `signatures` and `baseUrl` keys, written compactly with key order kept.
///
/// Signatures are computed over what was actually downloaded, so this works
/// from the raw manifest bytes rather than a re-encoding of the decoded value.
pub fn signature_payload(manifest_json: &[u8]) -> Result<Vec<u8>> {
    let mut tree: serde_json::Value = serde_json::from_slice(manifest_json)
        .map_err(|e| LoaderError::ManifestParse(e.to_string()))?;
    if let Some(object) = tree.as_object_mut() {
        object.shift_remove("signatures");
        object.shift_remove("baseUrl");
    }
    Ok(serde_json::to_vec(&tree)?)
}

/// A manifest together with the exact bytes it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedManifest {
    pub manifest_bytes: Vec<u8>,
    pub manifest: ZiplineManifest,
    pub fresh_at_epoch_ms: u64,
}

impl LoadedManifest {
    pub fn parse(manifest_bytes: Vec<u8>, fresh_at_epoch_ms: u64) -> Result<Self> {
        let manifest = ZiplineManifest::decode_json(&manifest_bytes)?;
        Ok(Self {
            manifest_bytes,
            manifest,
            fresh_at_epoch_ms,
        })
    }

    pub fn from_manifest(manifest: ZiplineManifest, fresh_at_epoch_ms: u64) -> Result<Self> {
        Ok(Self {
            manifest_bytes: manifest.encode_json()?,
            manifest,
            fresh_at_epoch_ms,
        })
    }
}

fn sort_topologically(
    mut remaining: IndexMap<String, ZiplineModule>,
) -> Result<IndexMap<String, ZiplineModule>, ManifestError> {
    let mut sorted = IndexMap::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining.values().position(|module| {
            module
                .depends_on_ids
                .iter()
                .all(|id| sorted.contains_key(id))
        });
        let Some(index) = ready else {
            return Err(ManifestError::Cycle(remaining.keys().cloned().collect()));
        };
        if let Some((id, module)) = remaining.shift_remove_index(index) {
            sorted.insert(id, module);
        }
    }
    Ok(sorted)
}

fn check_sorted(modules: &IndexMap<String, ZiplineModule>) -> Result<(), ManifestError> {
    let mut loaded = HashSet::with_capacity(modules.len());
    for (id, module) in modules {
        if !module
            .depends_on_ids
            .iter()
            .all(|dependency| loaded.contains(dependency.as_str()))
        {
            return Err(ManifestError::NotSorted);
        }
        loaded.insert(id.as_str());
    }
    Ok(())
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
