//! Build request decoding.
//!
//! Turns an inbound request into the pieces a backend needs without
//! touching the body: the body stream is moved into a [`BuildSource`]
//! unread, and everything else comes from the path, headers and query.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use axum::extract::Query;
use axum::http::{HeaderMap, Uri, header};
use kiln_core::version::CURRENT_API_VERSION;
use kiln_core::{
    ApiVersion, BuildOptions, BuildOutput, BuildSource, BuilderVersion, ByteStream,
    CachePruneOptions,
};
use serde::de::DeserializeOwned;

use crate::error::DecodeError;

/// Media types accepted for a build context.
const TAR_MEDIA_TYPES: &[&str] = &["application/x-tar", "application/tar"];

/// The raw pieces of a build request, before decoding.
pub struct InboundRequest {
    /// Version segment from the request path (`"v1.44"`), if any.
    pub version: Option<String>,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// `None` when the request carried no body at all.
    pub body: Option<ByteStream>,
}

impl InboundRequest {
    pub fn new(uri: Uri, body: Option<ByteStream>) -> Self {
        Self {
            version: None,
            uri,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

/// Result of decoding a build request.
#[derive(Debug)]
pub struct DecodedBuild {
    pub api_version: ApiVersion,
    pub options: BuildOptions,
    pub source: Option<BuildSource>,
}

/// Version policy plus the request-to-options mapping.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    default_version: ApiVersion,
    min_version: ApiVersion,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            default_version: CURRENT_API_VERSION,
            min_version: kiln_core::version::MIN_API_VERSION,
        }
    }
}

impl Decoder {
    pub fn new(default_version: ApiVersion, min_version: ApiVersion) -> Self {
        Self {
            default_version,
            min_version,
        }
    }

    pub fn default_version(&self) -> ApiVersion {
        self.default_version
    }

    /// Resolve the version segment of a request path.
    pub fn resolve_version(&self, raw: Option<&str>) -> Result<ApiVersion, DecodeError> {
        let Some(raw) = raw else {
            return Ok(self.default_version);
        };
        let requested: ApiVersion = raw
            .parse()
            .map_err(|_| DecodeError::InvalidVersion(raw.to_string()))?;
        if requested < self.min_version {
            return Err(DecodeError::VersionTooOld {
                requested,
                minimum: self.min_version,
            });
        }
        if requested > CURRENT_API_VERSION {
            return Err(DecodeError::VersionTooNew {
                requested,
                maximum: CURRENT_API_VERSION,
            });
        }
        Ok(requested)
    }

    /// Decode a build request. Never reads from the body.
    pub fn decode(&self, request: InboundRequest) -> Result<DecodedBuild, DecodeError> {
        let api_version = self.resolve_version(request.version.as_deref())?;

        if request.has_body() {
            check_media_type(&request.headers)?;
        }

        let params = Params::from_uri(&request.uri)?;
        let options = build_options(&params, api_version)?;

        Ok(DecodedBuild {
            api_version,
            options,
            source: request.body.map(BuildSource::from_boxed),
        })
    }
}

fn check_media_type(headers: &HeaderMap) -> Result<(), DecodeError> {
    let Some(value) = headers.get(header::CONTENT_TYPE) else {
        return Ok(());
    };
    let raw = value
        .to_str()
        .map_err(|_| DecodeError::UnsupportedMediaType("<non-ascii>".to_string()))?;
    let essence = raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    if TAR_MEDIA_TYPES.contains(&essence.as_str()) {
        Ok(())
    } else {
        Err(DecodeError::UnsupportedMediaType(raw.to_string()))
    }
}

/// `forcerm` implies `rm`, and an empty `rm` keeps the default.
fn remove_intermediates(params: &Params) -> bool {
    if params.bool("forcerm", false) {
        return true;
    }
    match params.get("rm") {
        None | Some("") => true,
        Some(_) => params.bool("rm", true),
    }
}

fn build_options(params: &Params, version: ApiVersion) -> Result<BuildOptions, DecodeError> {
    let mut options = BuildOptions {
        tags: params
            .all("t")
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        remote_context: params.string("remote"),
        no_cache: params.bool("nocache", false),
        remove: remove_intermediates(params),
        force_remove: params.bool("forcerm", false),
        pull: params.bool("pull", false),
        suppress_output: params.bool("q", false),
        target: params.string("target"),
        network_mode: params.string("networkmode"),
        build_id: params.string("buildid"),
        shm_size: params.int("shmsize")?,
        memory: params.int("memory")?,
        cpu_shares: params.int("cpushares")?,
        ..Default::default()
    };

    if let Some(dockerfile) = params.string("dockerfile") {
        options.dockerfile = dockerfile;
    }
    if let Some(args) = params.json::<BTreeMap<String, Option<String>>>("buildargs")? {
        options.build_args = args;
    }
    if let Some(labels) = params.json::<BTreeMap<String, String>>("labels")? {
        options.labels = labels;
    }
    if let Some(cache_from) = params.json::<Vec<String>>("cachefrom")? {
        options.cache_from = cache_from;
    }
    if let Some(raw) = params.get("version") {
        options.builder_version =
            BuilderVersion::from_param(raw).ok_or_else(|| DecodeError::InvalidParameter {
                name: "version",
                reason: format!("unsupported builder version {raw:?}"),
            })?;
    }
    if version.at_least(1, 32) {
        options.platform = params.string("platform");
    }
    if version.at_least(1, 40) {
        if let Some(outputs) = params.json::<Vec<BuildOutput>>("outputs")? {
            options.outputs = outputs;
        }
    }

    Ok(options)
}

/// Decode the query of a cache prune request.
pub fn prune_options(uri: &Uri) -> Result<CachePruneOptions, DecodeError> {
    let params = Params::from_uri(uri)?;
    Ok(CachePruneOptions {
        all: params.bool("all", false),
        keep_storage: params.int("keep-storage")?.unwrap_or(0),
        filters: params
            .json::<HashMap<String, Vec<String>>>("filters")?
            .unwrap_or_default(),
    })
}

/// Query parameters with repeated keys preserved in order.
struct Params(Vec<(String, String)>);

impl Params {
    fn from_uri(uri: &Uri) -> Result<Self, DecodeError> {
        if uri.query().is_none() {
            return Ok(Params(Vec::new()));
        }
        let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(uri)
            .map_err(|e| DecodeError::Query(e.body_text()))?;
        Ok(Params(pairs))
    }

    /// First value for `key`.
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Non-empty string value.
    fn string(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).map(str::to_string)
    }

    /// Empty, `0`, `no`, `false` and `none` are false; anything else is
    /// true. An absent key yields `default`.
    fn bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(v) => {
                let v = v.trim().to_ascii_lowercase();
                !matches!(v.as_str(), "" | "0" | "no" | "false" | "none")
            }
        }
    }

    fn int<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, DecodeError>
    where
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|e: T::Err| DecodeError::InvalidParameter {
                    name: key,
                    reason: e.to_string(),
                }),
        }
    }

    fn json<T: DeserializeOwned>(&self, key: &'static str) -> Result<Option<T>, DecodeError> {
        match self.string(key) {
            None => Ok(None),
            Some(v) => serde_json::from_str(&v)
                .map(Some)
                .map_err(|e| DecodeError::InvalidParameter {
                    name: key,
                    reason: e.to_string(),
                }),
        }
    }
}
