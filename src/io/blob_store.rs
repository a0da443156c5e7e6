use crate::config::StorageConfig;
use crate::types::{IceSurfError, IceSurfResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Object storage holding L2A scene files, one container per tile
pub trait BlobStore {
    /// Names of every object in a container
    fn list_blobs(&self, container: &str) -> IceSurfResult<Vec<String>>;

    /// Copy one object to a local path, returning the number of bytes written
    fn fetch_blob(&self, container: &str, name: &str, dest: &Path) -> IceSurfResult<u64>;
}

/// Build the store selected in the configuration
pub fn open_store(config: &StorageConfig) -> IceSurfResult<Box<dyn BlobStore>> {
    match config {
        StorageConfig::Azure {
            account_name,
            container_prefix,
            sas_token,
            account_key,
            endpoint,
        } => Ok(Box::new(AzureBlobStore::new(
            account_name,
            container_prefix,
            sas_token.clone(),
            account_key.as_deref(),
            endpoint.clone(),
        )?)),
        StorageConfig::Local { root } => Ok(Box::new(LocalBlobStore::new(root))),
    }
}

/// `List Blobs` response body
#[derive(Debug, Deserialize)]
struct EnumerationResults {
    #[serde(rename = "Blobs", default)]
    blobs: BlobList,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobEntry>,
}

#[derive(Debug, Deserialize)]
struct BlobEntry {
    #[serde(rename = "Name")]
    name: String,
}

/// Parse one page of a container listing into blob names and the continuation marker
pub fn parse_blob_listing(xml: &str) -> IceSurfResult<(Vec<String>, Option<String>)> {
    let results: EnumerationResults = quick_xml::de::from_str(xml)
        .map_err(|e| IceSurfError::InvalidFormat(format!("Failed to parse blob listing: {}", e)))?;

    let names = results.blobs.blob.into_iter().map(|b| b.name).collect();
    let marker = results
        .next_marker
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());

    Ok((names, marker))
}

/// Account name and decoded account key for Shared Key authorization
struct SharedKeyCredential {
    account_name: String,
    key: Vec<u8>,
}

impl SharedKeyCredential {
    fn new(account_name: &str, account_key: &str) -> IceSurfResult<Self> {
        let key = STANDARD
            .decode(account_key.trim())
            .map_err(|e| IceSurfError::Config(format!("account_key is not valid base64: {}", e)))?;

        Ok(Self {
            account_name: account_name.to_string(),
            key,
        })
    }

    /// Canonical request text covered by the signature.
    ///
    /// The eleven standard headers (Content-Encoding through Range) are empty
    /// for a body-less GET. `ms_headers` are the `x-ms-*` headers sent.
    fn string_to_sign(&self, verb: &str, url: &reqwest::Url, ms_headers: &[(&str, &str)]) -> String {
        let mut text = format!("{}\n", verb);
        text.push_str(&"\n".repeat(11));

        let mut headers: Vec<(String, &str)> = ms_headers
            .iter()
            .map(|(name, value)| (name.to_lowercase(), value.trim()))
            .collect();
        headers.sort();
        for (name, value) in headers {
            text.push_str(&format!("{}:{}\n", name, value));
        }

        text.push_str(&format!("/{}{}", self.account_name, url.path()));

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            params
                .entry(name.to_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            text.push_str(&format!("\n{}:{}", name, values.join(",")));
        }

        text
    }

    /// Base64 HMAC-SHA256 of the canonical text under the account key
    fn signature(&self, string_to_sign: &str) -> IceSurfResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| IceSurfError::Storage(format!("Invalid account key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn authorization(&self, string_to_sign: &str) -> IceSurfResult<String> {
        Ok(format!(
            "SharedKey {}:{}",
            self.account_name,
            self.signature(string_to_sign)?
        ))
    }
}

/// Azure Blob Storage accessed through the REST API
pub struct AzureBlobStore {
    base_url: String,
    container_prefix: String,
    sas_token: Option<String>,
    credential: Option<SharedKeyCredential>,
    client: reqwest::blocking::Client,
}

impl AzureBlobStore {
    const MAX_RETRIES: u32 = 3;
    const API_VERSION: &'static str = "2021-08-06";

    /// An account key takes precedence over a SAS token; with neither the
    /// container must allow anonymous reads.
    pub fn new(
        account_name: &str,
        container_prefix: &str,
        sas_token: Option<String>,
        account_key: Option<&str>,
        endpoint: Option<String>,
    ) -> IceSurfResult<Self> {
        let base_url = endpoint
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", account_name))
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .user_agent(concat!("icesurf/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IceSurfError::Storage(format!("Failed to create HTTP client: {}", e)))?;

        let credential = account_key
            .map(|key| SharedKeyCredential::new(account_name, key))
            .transpose()?;
        let sas_token = match (&credential, sas_token) {
            (Some(_), Some(_)) => {
                log::warn!("Both account_key and sas_token are set, signing with the account key");
                None
            }
            (_, token) => token.map(|t| t.trim_start_matches('?').to_string()),
        };

        Ok(Self {
            base_url,
            container_prefix: container_prefix.to_string(),
            sas_token,
            credential,
            client,
        })
    }

    /// GET request carrying the service version and, with an account key,
    /// a Shared Key authorization header
    fn get(&self, url: &reqwest::Url) -> IceSurfResult<reqwest::blocking::RequestBuilder> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let mut request = self
            .client
            .get(url.clone())
            .header("x-ms-date", date.as_str())
            .header("x-ms-version", Self::API_VERSION);

        if let Some(credential) = &self.credential {
            let headers = [("x-ms-date", date.as_str()), ("x-ms-version", Self::API_VERSION)];
            let string_to_sign = credential.string_to_sign("GET", url, &headers);
            request = request.header(
                reqwest::header::AUTHORIZATION,
                credential.authorization(&string_to_sign)?,
            );
        }

        Ok(request)
    }

    fn container_name(&self, container: &str) -> String {
        format!("{}{}", self.container_prefix, container)
    }

    /// URL of a container, or of one blob inside it
    fn url(&self, container: &str, blob: Option<&str>) -> IceSurfResult<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| IceSurfError::Storage(format!("Invalid endpoint {}: {}", self.base_url, e)))?;

        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                IceSurfError::Storage(format!("Endpoint cannot be a base URL: {}", self.base_url))
            })?;
            segments.pop_if_empty().push(&self.container_name(container));
            if let Some(name) = blob {
                segments.extend(name.split('/'));
            }
        }

        url.set_query(self.sas_token.as_deref());
        Ok(url)
    }

    fn try_fetch_once(&self, url: &reqwest::Url, dest: &Path) -> IceSurfResult<u64> {
        let response = self
            .get(url)?
            .send()
            .map_err(|e| IceSurfError::Storage(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(IceSurfError::Storage(format!(
                "HTTP {} {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or(""),
                url.path()
            )));
        }

        let content = response
            .bytes()
            .map_err(|e| IceSurfError::Storage(format!("Failed to read response body: {}", e)))?;

        if content.is_empty() {
            return Err(IceSurfError::Storage(format!(
                "Empty response body for {}",
                url.path()
            )));
        }

        std::fs::write(dest, &content)?;
        log::debug!("Downloaded {} bytes to {}", content.len(), dest.display());

        Ok(content.len() as u64)
    }
}

impl BlobStore for AzureBlobStore {
    fn list_blobs(&self, container: &str) -> IceSurfResult<Vec<String>> {
        let url = self.url(container, None)?;
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            // query parameters are part of the signed resource
            let mut page_url = url.clone();
            page_url
                .query_pairs_mut()
                .append_pair("restype", "container")
                .append_pair("comp", "list");
            if let Some(m) = &marker {
                page_url.query_pairs_mut().append_pair("marker", m);
            }

            let response = self
                .get(&page_url)?
                .send()
                .map_err(|e| IceSurfError::Storage(format!("Failed to list container: {}", e)))?;

            if !response.status().is_success() {
                return Err(IceSurfError::Storage(format!(
                    "Listing container {} failed: {}",
                    self.container_name(container),
                    response.status()
                )));
            }

            let body = response
                .text()
                .map_err(|e| IceSurfError::Storage(format!("Failed to read listing: {}", e)))?;

            let (page, next) = parse_blob_listing(&body)?;
            log::debug!("Listed {} blobs", page.len());
            names.extend(page);

            match next {
                Some(m) => marker = Some(m),
                None => break,
            }
        }

        log::info!(
            "Container {} holds {} blobs",
            self.container_name(container),
            names.len()
        );
        Ok(names)
    }

    fn fetch_blob(&self, container: &str, name: &str, dest: &Path) -> IceSurfResult<u64> {
        let url = self.url(container, Some(name))?;
        let mut last_error = None;

        for attempt in 1..=Self::MAX_RETRIES {
            log::debug!("Download attempt {} of {} for {}", attempt, Self::MAX_RETRIES, name);

            match self.try_fetch_once(&url, dest) {
                Ok(size) => return Ok(size),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < Self::MAX_RETRIES {
                        log::warn!("Download attempt {} failed, retrying...", attempt);
                        std::thread::sleep(std::time::Duration::from_secs(2));
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            IceSurfError::Storage("Download failed after all retries".to_string())
        }))
    }
}

/// Directory tree laid out like a blob account: `{root}/{container}/{name}`
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn collect_files(dir: &Path, prefix: &str, names: &mut Vec<String>) -> IceSurfResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let name = if prefix.is_empty() {
                file_name
            } else {
                format!("{}/{}", prefix, file_name)
            };

            if entry.file_type()?.is_dir() {
                Self::collect_files(&entry.path(), &name, names)?;
            } else {
                names.push(name);
            }
        }
        Ok(())
    }
}

impl BlobStore for LocalBlobStore {
    fn list_blobs(&self, container: &str) -> IceSurfResult<Vec<String>> {
        let dir = self.root.join(container);
        if !dir.is_dir() {
            return Err(IceSurfError::Storage(format!(
                "Container not found: {}",
                dir.display()
            )));
        }

        let mut names = Vec::new();
        Self::collect_files(&dir, "", &mut names)?;
        names.sort();
        Ok(names)
    }

    fn fetch_blob(&self, container: &str, name: &str, dest: &Path) -> IceSurfResult<u64> {
        let source = name
            .split('/')
            .fold(self.root.join(container), |path, part| path.join(part));
        Ok(std::fs::copy(&source, dest)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://tothepoles.blob.core.windows.net/" ContainerName="22wev">
  <Blobs>
    <Blob>
      <Name>S2A_MSIL2A_20170605T151911/T22WEV_20170605T151911_B02_20m.jp2</Name>
      <Properties><Content-Length>1024</Content-Length></Properties>
    </Blob>
    <Blob>
      <Name>S2A_MSIL2A_20170605T151911/L2A_T22WEV_20170605T151911_CLD_20m.jp2</Name>
    </Blob>
  </Blobs>
  <NextMarker>2!96!MDAwMDQ2</NextMarker>
</EnumerationResults>"#;

    #[test]
    fn test_parse_blob_listing() {
        let (names, marker) = parse_blob_listing(LISTING).unwrap();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("_B02_20m.jp2"));
        assert_eq!(marker.as_deref(), Some("2!96!MDAwMDQ2"));
    }

    #[test]
    fn test_parse_last_page_has_no_marker() {
        let xml = r#"<EnumerationResults><Blobs></Blobs><NextMarker /></EnumerationResults>"#;
        let (names, marker) = parse_blob_listing(xml).unwrap();
        assert!(names.is_empty());
        assert!(marker.is_none());
    }

    #[test]
    fn test_blob_url_encoding() {
        let store = AzureBlobStore::new(
            "tothepoles",
            "s2-",
            Some("?sv=2019&sig=abc".to_string()),
            None,
            None,
        )
        .unwrap();

        let url = store.url("22wev", Some("dir/T22WEV_B02_20m.jp2")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://tothepoles.blob.core.windows.net/s2-22wev/dir/T22WEV_B02_20m.jp2?sv=2019&sig=abc"
        );
    }

    const LIST_STRING_TO_SIGN: &str = "GET\n\n\n\n\n\n\n\n\n\n\n\n\
x-ms-date:Mon, 05 Jun 2017 15:19:11 GMT\n\
x-ms-version:2021-08-06\n\
/tothepoles/s2-22wev\n\
comp:list\n\
marker:2!96!MDAwMDQ2\n\
restype:container";

    #[test]
    fn test_shared_key_string_to_sign() {
        let credential = SharedKeyCredential::new("tothepoles", "SmVmZQ==").unwrap();
        let mut url = reqwest::Url::parse("https://tothepoles.blob.core.windows.net/s2-22wev").unwrap();
        url.query_pairs_mut()
            .append_pair("restype", "container")
            .append_pair("comp", "list")
            .append_pair("marker", "2!96!MDAwMDQ2");

        // header order and case do not matter
        let headers = [
            ("x-ms-version", "2021-08-06"),
            ("X-MS-Date", "Mon, 05 Jun 2017 15:19:11 GMT"),
        ];
        assert_eq!(
            credential.string_to_sign("GET", &url, &headers),
            LIST_STRING_TO_SIGN
        );
    }

    #[test]
    fn test_shared_key_signature() {
        // RFC 4231 test case 2: key "Jefe"
        let credential = SharedKeyCredential::new("tothepoles", "SmVmZQ==").unwrap();
        assert_eq!(
            credential.signature("what do ya want for nothing?").unwrap(),
            "W9zBRr9gdU5qBCQmCJV1x1oAPwidJzmDnexYuWTsOEM="
        );

        let credential = SharedKeyCredential::new(
            "tothepoles",
            "aWNlc3VyZi1zaGFyZWQta2V5LXRlc3QtdmVjdG9yLTAxMjM0NTY3ODk=",
        )
        .unwrap();
        assert_eq!(
            credential.authorization(LIST_STRING_TO_SIGN).unwrap(),
            "SharedKey tothepoles:+tH7jxs6RxelJiDJY3ip9ATwFlSBguUl+F/oxplRbJQ="
        );
    }

    #[test]
    fn test_account_key_replaces_sas_token() {
        let store = AzureBlobStore::new(
            "tothepoles",
            "",
            Some("sv=2019&sig=abc".to_string()),
            Some("SmVmZQ=="),
            None,
        )
        .unwrap();
        assert!(store.credential.is_some());
        assert_eq!(store.url("22wev", None).unwrap().query(), None);

        assert!(matches!(
            AzureBlobStore::new("tothepoles", "", None, Some("not base64!"), None),
            Err(IceSurfError::Config(_))
        ));
    }

    #[test]
    fn test_local_store_lists_and_fetches() {
        let root = tempfile::tempdir().unwrap();
        let container = root.path().join("22wev").join("GRANULE");
        std::fs::create_dir_all(&container).unwrap();
        std::fs::write(container.join("a_B02_20m.jp2"), b"data").unwrap();
        std::fs::write(root.path().join("22wev").join("readme.txt"), b"x").unwrap();

        let store = LocalBlobStore::new(root.path());
        let names = store.list_blobs("22wev").unwrap();
        assert_eq!(names, vec!["GRANULE/a_B02_20m.jp2".to_string(), "readme.txt".to_string()]);

        let dest = root.path().join("copy.jp2");
        let size = store.fetch_blob("22wev", &names[0], &dest).unwrap();
        assert_eq!(size, 4);
        assert!(store.list_blobs("missing").is_err());
    }
}
