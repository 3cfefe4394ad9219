//! Wire types exchanged with the request stream, the VM bridge and object storage.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// HTTP-triggered invocation carried on the request topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub method: String,
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_version: Option<String>,
}

impl InvocationRequest {
    /// Function id and version, if both are present and non-empty.
    pub fn function_ref(&self) -> Option<(&str, &str)> {
        match (self.function_id.as_deref(), self.function_version.as_deref()) {
            (Some(id), Some(version)) if !id.is_empty() && !version.is_empty() => Some((id, version)),
            _ => None,
        }
    }

    /// Composite `{functionId}:{functionVersion}` key, if the request was enriched.
    pub fn function_key(&self) -> Option<String> {
        self.function_ref()
            .map(|(id, version)| format!("{}:{}", id, version))
    }
}

/// HTTP response produced by a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub status_code: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl InvocationResponse {
    /// Synthetic response used when the VM posts something unreadable.
    pub fn bad_gateway(reason: &str) -> Self {
        Self {
            status_code: 502,
            body: reason.to_string(),
            headers: HashMap::new(),
        }
    }
}

/// Unit of work handed to a VM polling `GET /next`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub correlation_id: String,
    pub request: InvocationRequest,
}

/// Compression applied to an image blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Compression {
    #[default]
    None,
    Deflate,
    Tar,
}

impl<'de> Deserialize<'de> for Compression {
    /// Accepts either the variant name or its numeric value.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u8),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(0) => Ok(Self::None),
            Raw::Number(1) => Ok(Self::Deflate),
            Raw::Number(2) => Ok(Self::Tar),
            Raw::Name(name) => match name.to_ascii_lowercase().as_str() {
                "none" => Ok(Self::None),
                "deflate" => Ok(Self::Deflate),
                "tar" => Ok(Self::Tar),
                _ => Err(serde::de::Error::custom(format!(
                    "unknown compression method: {}",
                    name
                ))),
            },
            Raw::Number(n) => Err(serde::de::Error::custom(format!(
                "unknown compression method: {}",
                n
            ))),
        }
    }
}

/// Per-version function manifest stored in `function-manifests`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionManifest {
    pub function_id: String,
    pub version_id: String,
    pub runtime_image: String,
    #[serde(default)]
    pub runtime_compression: Compression,
    #[serde(default)]
    pub overlay_compression: Compression,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_request_camel_case() {
        let raw = r#"{
            "method": "GET",
            "host": "example.com",
            "path": "/hello",
            "body": "",
            "headers": {"accept": "text/plain"},
            "functionId": "f1",
            "functionVersion": "v2"
        }"#;
        let request: InvocationRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.function_key().as_deref(), Some("f1:v2"));
        assert_eq!(request.headers["accept"], "text/plain");
    }

    #[test]
    fn test_function_key_requires_both_parts() {
        let request: InvocationRequest =
            serde_json::from_str(r#"{"method":"GET","host":"h","path":"/","functionId":"f1"}"#)
                .unwrap();
        assert_eq!(request.function_key(), None);
    }

    #[rstest]
    #[case(Some("f1"), Some("v2"), Some(("f1", "v2")))]
    #[case(Some("f1"), Some(""), None)]
    #[case(Some(""), Some("v2"), None)]
    #[case(None, Some("v2"), None)]
    fn test_function_ref(
        #[case] id: Option<&str>,
        #[case] version: Option<&str>,
        #[case] expected: Option<(&str, &str)>,
    ) {
        let request = InvocationRequest {
            method: "GET".to_string(),
            host: "h".to_string(),
            path: "/".to_string(),
            body: String::new(),
            headers: HashMap::new(),
            function_id: id.map(str::to_string),
            function_version: version.map(str::to_string),
        };
        assert_eq!(request.function_ref(), expected);
        assert_eq!(
            request.function_key(),
            expected.map(|(id, version)| format!("{}:{}", id, version))
        );
    }

    #[rstest]
    #[case("0", Compression::None)]
    #[case("1", Compression::Deflate)]
    #[case("2", Compression::Tar)]
    #[case(r#""Deflate""#, Compression::Deflate)]
    #[case(r#""tar""#, Compression::Tar)]
    fn test_compression_forms(#[case] raw: &str, #[case] expected: Compression) {
        assert_eq!(serde_json::from_str::<Compression>(raw).unwrap(), expected);
    }

    #[test]
    fn test_unknown_compression() {
        assert!(serde_json::from_str::<Compression>("7").is_err());
        assert!(serde_json::from_str::<Compression>(r#""zstd""#).is_err());
    }

    #[test]
    fn test_manifest() {
        let raw = r#"{
            "functionId": "0b4c",
            "versionId": "7d1e",
            "runtimeImage": "node22.ext4",
            "runtimeCompression": 2,
            "overlayCompression": "Deflate"
        }"#;
        let manifest: FunctionManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.runtime_image, "node22.ext4");
        assert_eq!(manifest.runtime_compression, Compression::Tar);
        assert_eq!(manifest.overlay_compression, Compression::Deflate);
    }
}
