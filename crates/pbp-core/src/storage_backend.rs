//! Object store abstraction
//!
//! Audio and metadata may live on the local filesystem, in an S3-like bucket
//! (`s3://`, optionally authenticated), in a GCS-like bucket (`gs://`,
//! anonymous) or behind a public `http(s)://` URL. The engine only needs to
//! list objects under a prefix and fetch one object to a local path.

use crate::config::StorageConfig;
use crate::error::{PbpError, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A resolved object location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectLocation {
    Local(PathBuf),
    S3 { bucket: String, key: String },
    Gs { bucket: String, key: String },
    Http(String),
}

impl ObjectLocation {
    pub fn is_remote(&self) -> bool {
        !matches!(self, ObjectLocation::Local(_))
    }

    /// Canonical URI, used as cache key
    pub fn uri(&self) -> String {
        match self {
            ObjectLocation::Local(path) => path.display().to_string(),
            ObjectLocation::S3 { bucket, key } => format!("s3://{bucket}/{key}"),
            ObjectLocation::Gs { bucket, key } => format!("gs://{bucket}/{key}"),
            ObjectLocation::Http(url) => url.clone(),
        }
    }

    /// Last path component
    pub fn simple_name(&self) -> String {
        match self {
            ObjectLocation::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ObjectLocation::S3 { key, .. } | ObjectLocation::Gs { key, .. } => {
                key.rsplit('/').next().unwrap_or_default().to_string()
            }
            ObjectLocation::Http(url) => {
                let path = url.split(['?', '#']).next().unwrap_or_default();
                path.rsplit('/').next().unwrap_or_default().to_string()
            }
        }
    }

    /// Object named `name` in the same directory or key prefix
    pub fn sibling(&self, name: &str) -> ObjectLocation {
        fn replace_last(path: &str, name: &str) -> String {
            match path.rsplit_once('/') {
                Some((dir, _)) => format!("{dir}/{name}"),
                None => name.to_string(),
            }
        }

        match self {
            ObjectLocation::Local(path) => ObjectLocation::Local(path.with_file_name(name)),
            ObjectLocation::S3 { bucket, key } => ObjectLocation::S3 {
                bucket: bucket.clone(),
                key: replace_last(key, name),
            },
            ObjectLocation::Gs { bucket, key } => ObjectLocation::Gs {
                bucket: bucket.clone(),
                key: replace_last(key, name),
            },
            ObjectLocation::Http(url) => {
                let path = url.split(['?', '#']).next().unwrap_or_default();
                ObjectLocation::Http(replace_last(path, name))
            }
        }
    }
}

/// Abstract object store
pub trait ObjectStore: Send + Sync {
    /// Objects whose location starts with `prefix`
    fn list(&self, prefix: &ObjectLocation) -> Result<Vec<ObjectLocation>>;

    /// Copy one object to `dest`
    fn fetch(&self, location: &ObjectLocation, dest: &Path) -> Result<()>;
}

/// Turns configured URIs into [`ObjectLocation`]s
#[derive(Debug, Clone, Default)]
pub struct UriResolver {
    map_prefix: Option<(String, String)>,
    audio_base_dir: Option<PathBuf>,
    path_prefix: String,
}

impl UriResolver {
    pub fn new(config: &StorageConfig) -> Self {
        let map_prefix = config
            .path_map_prefix
            .split_once('~')
            .map(|(old, new)| (old.to_string(), new.to_string()));
        Self {
            map_prefix,
            audio_base_dir: config.audio_base_dir.as_ref().map(PathBuf::from),
            path_prefix: config.path_prefix.clone(),
        }
    }

    /// Apply the `old~new` prefix rewrite
    pub fn map_prefix(&self, uri: &str) -> String {
        match &self.map_prefix {
            Some((old, new)) if !old.is_empty() && uri.starts_with(old.as_str()) => {
                format!("{}{}", new, &uri[old.len()..])
            }
            _ => uri.to_string(),
        }
    }

    pub fn resolve(&self, uri: &str) -> Result<ObjectLocation> {
        let uri = self.map_prefix(uri);

        if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, key) = split_bucket(&uri, rest)?;
            return Ok(ObjectLocation::S3 { bucket, key });
        }
        if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, key) = split_bucket(&uri, rest)?;
            return Ok(ObjectLocation::Gs { bucket, key });
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(ObjectLocation::Http(uri));
        }
        if let Some(rest) = uri.strip_prefix("file://") {
            // file:///abs/path is absolute, file://dir/file is relative
            return Ok(ObjectLocation::Local(match rest.strip_prefix('/') {
                Some(abs) => PathBuf::from(format!("{}/{}", self.path_prefix, abs)),
                None => self.relative(rest),
            }));
        }
        if let Some((scheme, _)) = uri.split_once("://") {
            return Err(PbpError::retrieval(
                uri.clone(),
                format!("unsupported scheme '{scheme}'"),
                false,
            ));
        }

        let path = Path::new(&uri);
        Ok(ObjectLocation::Local(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.relative(&uri)
        }))
    }

    fn relative(&self, path: &str) -> PathBuf {
        match &self.audio_base_dir {
            Some(base) => base.join(path),
            None => PathBuf::from(path),
        }
    }
}

fn split_bucket(uri: &str, rest: &str) -> Result<(String, String)> {
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(PbpError::retrieval(uri, "missing bucket name", false));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Local filesystem store
#[derive(Debug, Clone, Default)]
pub struct LocalStore;

impl ObjectStore for LocalStore {
    fn list(&self, prefix: &ObjectLocation) -> Result<Vec<ObjectLocation>> {
        let ObjectLocation::Local(path) = prefix else {
            return Err(PbpError::retrieval(prefix.uri(), "not a local path", false));
        };

        let (dir, name_prefix) = if path.is_dir() {
            (path.clone(), String::new())
        } else {
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (dir, name)
        };

        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(name_prefix.as_str())
            {
                found.push(ObjectLocation::Local(path));
            }
        }
        found.sort_by(|a, b| a.uri().cmp(&b.uri()));
        Ok(found)
    }

    fn fetch(&self, location: &ObjectLocation, dest: &Path) -> Result<()> {
        let ObjectLocation::Local(path) = location else {
            return Err(PbpError::retrieval(location.uri(), "not a local path", false));
        };
        std::fs::copy(path, dest)?;
        Ok(())
    }
}

/// HTTP access to s3, gs and public URLs
pub struct HttpObjectStore {
    agent: ureq::Agent,
    s3_endpoint: String,
    gs_endpoint: String,
    auth_token: Option<String>,
}

#[derive(Deserialize)]
struct GcsListing {
    #[serde(default)]
    items: Vec<GcsItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct GcsItem {
    name: String,
}

impl HttpObjectStore {
    pub fn new(config: &StorageConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            agent,
            s3_endpoint: config.s3_endpoint.trim_end_matches('/').to_string(),
            gs_endpoint: config.gs_endpoint.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        }
    }

    fn s3_base(&self, bucket: &str) -> String {
        if self.s3_endpoint.contains("{bucket}") {
            self.s3_endpoint.replace("{bucket}", bucket)
        } else {
            format!("{}/{}", self.s3_endpoint, bucket)
        }
    }

    fn object_url(&self, location: &ObjectLocation) -> Result<String> {
        match location {
            ObjectLocation::S3 { bucket, key } => Ok(format!("{}/{}", self.s3_base(bucket), key)),
            ObjectLocation::Gs { bucket, key } => {
                Ok(format!("{}/{}/{}", self.gs_endpoint, bucket, key))
            }
            ObjectLocation::Http(url) => Ok(url.clone()),
            ObjectLocation::Local(_) => Err(PbpError::retrieval(
                location.uri(),
                "local path given to remote store",
                false,
            )),
        }
    }

    fn get(&self, url: &str, is_s3: bool) -> ureq::Request {
        let request = self.agent.get(url);
        match (&self.auth_token, is_s3) {
            (Some(token), true) => request.set("Authorization", &format!("Bearer {token}")),
            _ => request,
        }
    }

    fn call(&self, uri: &str, request: ureq::Request) -> Result<ureq::Response> {
        request.call().map_err(|e| match e {
            ureq::Error::Status(status, _) => {
                // 404 is retried as well
                let retryable = !matches!(status, 400 | 401 | 403);
                PbpError::retrieval(uri, format!("HTTP status {status}"), retryable)
            }
            ureq::Error::Transport(transport) => {
                PbpError::retrieval(uri, format!("transport error: {transport}"), true)
            }
        })
    }

    fn list_s3(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectLocation>> {
        let url = self.s3_base(bucket);
        let key_re = Regex::new(r"<Key>([^<]*)</Key>")?;
        let token_re = Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>")?;
        let mut found = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut request = self
                .get(&url, true)
                .query("list-type", "2")
                .query("prefix", prefix);
            if let Some(t) = &token {
                request = request.query("continuation-token", t);
            }
            let body = self
                .call(&url, request)?
                .into_string()
                .map_err(|e| PbpError::retrieval(url.as_str(), e, true))?;

            for cap in key_re.captures_iter(&body) {
                found.push(ObjectLocation::S3 {
                    bucket: bucket.to_string(),
                    key: unescape_xml(&cap[1]),
                });
            }

            token = token_re
                .captures(&body)
                .map(|cap| unescape_xml(&cap[1]));
            if token.is_none() {
                break;
            }
        }
        Ok(found)
    }

    fn list_gs(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectLocation>> {
        let url = format!("{}/storage/v1/b/{}/o", self.gs_endpoint, bucket);
        let mut found = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut request = self.get(&url, false).query("prefix", prefix);
            if let Some(t) = &token {
                request = request.query("pageToken", t);
            }
            let listing: GcsListing = self
                .call(&url, request)?
                .into_json()
                .map_err(|e| PbpError::retrieval(url.as_str(), e, true))?;

            found.extend(listing.items.into_iter().map(|item| ObjectLocation::Gs {
                bucket: bucket.to_string(),
                key: item.name,
            }));

            token = listing.next_page_token;
            if token.is_none() {
                break;
            }
        }
        Ok(found)
    }
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

impl ObjectStore for HttpObjectStore {
    fn list(&self, prefix: &ObjectLocation) -> Result<Vec<ObjectLocation>> {
        match prefix {
            ObjectLocation::S3 { bucket, key } => self.list_s3(bucket, key),
            ObjectLocation::Gs { bucket, key } => self.list_gs(bucket, key),
            other => Err(PbpError::retrieval(
                other.uri(),
                "listing is only supported for s3:// and gs://",
                false,
            )),
        }
    }

    fn fetch(&self, location: &ObjectLocation, dest: &Path) -> Result<()> {
        let uri = location.uri();
        let url = self.object_url(location)?;
        let is_s3 = matches!(location, ObjectLocation::S3 { .. });
        let response = self.call(&uri, self.get(&url, is_s3))?;

        let mut writer = BufWriter::new(File::create(dest)?);
        std::io::copy(&mut response.into_reader(), &mut writer)
            .map_err(|e| PbpError::retrieval(uri.as_str(), format!("read error: {e}"), true))?;
        std::io::Write::flush(&mut writer)?;
        Ok(())
    }
}

/// Dispatches between the local and remote stores
pub struct StoreRegistry {
    resolver: UriResolver,
    local: LocalStore,
    remote: Box<dyn ObjectStore>,
}

impl StoreRegistry {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            resolver: UriResolver::new(config),
            local: LocalStore,
            remote: Box::new(HttpObjectStore::new(config)),
        }
    }

    /// Replace the remote store
    pub fn with_remote(mut self, remote: Box<dyn ObjectStore>) -> Self {
        self.remote = remote;
        self
    }

    pub fn resolver(&self) -> &UriResolver {
        &self.resolver
    }

    pub fn resolve(&self, uri: &str) -> Result<ObjectLocation> {
        self.resolver.resolve(uri)
    }

    pub fn list(&self, prefix: &ObjectLocation) -> Result<Vec<ObjectLocation>> {
        if prefix.is_remote() {
            self.remote.list(prefix)
        } else {
            self.local.list(prefix)
        }
    }

    pub fn fetch(&self, location: &ObjectLocation, dest: &Path) -> Result<()> {
        if location.is_remote() {
            self.remote.fetch(location, dest)
        } else {
            self.local.fetch(location, dest)
        }
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(map: &str, base: Option<&str>, prefix: &str) -> UriResolver {
        let config = StorageConfig {
            path_map_prefix: map.to_string(),
            audio_base_dir: base.map(str::to_string),
            path_prefix: prefix.to_string(),
            ..StorageConfig::default()
        };
        UriResolver::new(&config)
    }

    #[test]
    fn test_resolve_schemes() {
        let r = resolver("", None, "");
        assert_eq!(
            r.resolve("s3://pacific-sound-16khz/2022/09/MARS_20220902_000000.wav")
                .unwrap(),
            ObjectLocation::S3 {
                bucket: "pacific-sound-16khz".into(),
                key: "2022/09/MARS_20220902_000000.wav".into()
            }
        );
        assert!(matches!(
            r.resolve("gs://noaa-passive-bioacoustic/nrs/NRS11_20200101_000000.flac"),
            Ok(ObjectLocation::Gs { .. })
        ));
        assert!(matches!(
            r.resolve("https://example.org/a.wav"),
            Ok(ObjectLocation::Http(_))
        ));
        assert!(r.resolve("ftp://host/a.wav").is_err());
        assert!(r.resolve("s3:///key").is_err());
    }

    #[test]
    fn test_resolve_local_paths() {
        let r = resolver("", Some("/data/audio"), "/mnt");
        assert_eq!(
            r.resolve("file:///recordings/a.wav").unwrap(),
            ObjectLocation::Local(PathBuf::from("/mnt/recordings/a.wav"))
        );
        assert_eq!(
            r.resolve("file://2022/a.wav").unwrap(),
            ObjectLocation::Local(PathBuf::from("/data/audio/2022/a.wav"))
        );
        assert_eq!(
            r.resolve("sub/a.wav").unwrap(),
            ObjectLocation::Local(PathBuf::from("/data/audio/sub/a.wav"))
        );
        assert_eq!(
            r.resolve("/abs/a.wav").unwrap(),
            ObjectLocation::Local(PathBuf::from("/abs/a.wav"))
        );
    }

    #[test]
    fn test_prefix_mapping() {
        let r = resolver("s3://pacific-sound-16khz~file:///PAM_Archive", None, "");
        let loc = r
            .resolve("s3://pacific-sound-16khz/2022/09/MARS_20220902_000000.wav")
            .unwrap();
        assert_eq!(
            loc,
            ObjectLocation::Local(PathBuf::from("/PAM_Archive/2022/09/MARS_20220902_000000.wav"))
        );
    }

    #[test]
    fn test_simple_name() {
        let loc = ObjectLocation::Http("https://host/dir/x.flac?sig=abc".into());
        assert_eq!(loc.simple_name(), "x.flac");
        let loc = ObjectLocation::S3 {
            bucket: "b".into(),
            key: "a/b/c.wav".into(),
        };
        assert_eq!(loc.simple_name(), "c.wav");
        assert_eq!(loc.uri(), "s3://b/a/b/c.wav");
    }

    #[test]
    fn test_sibling() {
        let loc = ObjectLocation::S3 {
            bucket: "b".into(),
            key: "a/6550.220902001530.wav".into(),
        };
        assert_eq!(
            loc.sibling("6550.220902001530.log.xml").uri(),
            "s3://b/a/6550.220902001530.log.xml"
        );
        let loc = ObjectLocation::Gs {
            bucket: "b".into(),
            key: "top.flac".into(),
        };
        assert_eq!(loc.sibling("x").uri(), "gs://b/x");
        let loc = ObjectLocation::Local(PathBuf::from("/data/st/a.wav"));
        assert_eq!(
            loc.sibling("a.log.xml"),
            ObjectLocation::Local(PathBuf::from("/data/st/a.log.xml"))
        );
        let loc = ObjectLocation::Http("https://host/dir/x.wav?sig=1".into());
        assert_eq!(loc.sibling("x.log.xml").uri(), "https://host/dir/x.log.xml");
    }

    #[test]
    fn test_local_listing_with_name_prefix() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["MARS_1.wav", "MARS_2.wav", "OTHER_1.wav"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let store = LocalStore;

        let all = store
            .list(&ObjectLocation::Local(dir.path().to_path_buf()))
            .unwrap();
        assert_eq!(all.len(), 3);

        let mars = store
            .list(&ObjectLocation::Local(dir.path().join("MARS_")))
            .unwrap();
        assert_eq!(mars.len(), 2);
        assert!(mars.iter().all(|l| l.simple_name().starts_with("MARS_")));
    }

    #[test]
    fn test_unescape_xml() {
        assert_eq!(unescape_xml("a&amp;b&lt;c"), "a&b<c");
    }
}
