// Downloader for GGUF model files
// Streams an HTTPS response to disk in 1 MiB blocks with progress reporting

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::catalog::{recommended_model, CatalogEntry};
use crate::error::DownloadError;
use crate::model_store::{ModelStore, MODEL_EXTENSION};

pub const HF_HOST: &str = "https://huggingface.co";
pub const DEFAULT_REVISION: &str = "main";
pub const USER_AGENT: &str = "Contour-LLM-Download/1.0";

/// Bytes written (and reported) per block
pub const BLOCK_SIZE: usize = 1024 * 1024;

const MIB: f64 = 1024.0 * 1024.0;

/// Progress of one transfer, reported only when the server sends Content-Length
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DownloadProgress {
    /// Percentage complete, clamped to 0-100
    pub percent: f64,
    pub downloaded_mib: f64,
    pub total_mib: f64,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: u64) -> Self {
        let percent = if total > 0 {
            (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            percent,
            downloaded_mib: downloaded as f64 / MIB,
            total_mib: total as f64 / MIB,
        }
    }
}

/// Direct download URL for a file in a Hugging Face repository.
///
/// `repo` is "owner/name"; a bare name is used as both owner and name.
pub fn build_url(repo: &str, file: &str, revision: &str) -> String {
    hub_file_url(HF_HOST, repo, file, revision)
}

fn hub_file_url(host: &str, repo: &str, file: &str, revision: &str) -> String {
    let repo = repo.trim().trim_matches('/');
    let (owner, name) = repo.split_once('/').unwrap_or((repo, repo));
    format!(
        "{}/{}/{}/resolve/{}/{}",
        host.trim_end_matches('/'),
        owner,
        name,
        revision,
        file
    )
}

/// Last path segment of `url`, without query or fragment.
pub fn file_name_from_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        if let Some(name) = parsed
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        {
            return name.to_string();
        }
    }
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Append `.gguf` unless the name already has it.
pub fn ensure_extension(name: &str) -> String {
    let suffix = format!(".{}", MODEL_EXTENSION);
    if name.to_ascii_lowercase().ends_with(&suffix) {
        name.to_string()
    } else {
        format!("{}{}", name, suffix)
    }
}

/// Name to save a model under, with `.gguf` appended when missing. Only
/// plain file names are accepted so a download cannot leave the models
/// directory.
pub fn artifact_name(name: &str) -> Result<String, DownloadError> {
    let plain = !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\']);
    if !plain {
        return Err(DownloadError::InvalidName(name.to_string()));
    }
    Ok(ensure_extension(name))
}

/// HTTP client for model downloads
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    hub: String,
}

impl Downloader {
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .use_rustls_tls()
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(DownloadError::from_transport)?;
        Ok(Self {
            client,
            hub: HF_HOST.to_string(),
        })
    }

    /// Resolve repository references against another host (mirrors, tests).
    pub fn with_hub(mut self, hub: impl Into<String>) -> Self {
        self.hub = hub.into();
        self
    }

    pub fn repo_file_url(&self, repo: &str, file: &str, revision: &str) -> String {
        hub_file_url(&self.hub, repo, file, revision)
    }

    /// Download `url` to `dest`.
    ///
    /// Returns `Ok(false)` without any network traffic when `dest` exists and
    /// `overwrite` is false. A failed transfer leaves the partial file behind.
    pub async fn fetch<F>(
        &self,
        url: &str,
        dest: &Path,
        overwrite: bool,
        mut on_progress: F,
    ) -> Result<bool, DownloadError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        if dest.is_file() && !overwrite {
            log::info!("Already exists, skipping download: {}", dest.display());
            return Ok(false);
        }

        let io_err = |source| DownloadError::Io {
            path: dest.to_path_buf(),
            source,
        };

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        log::info!("Downloading from: {}", url);
        log::info!("Saving to: {}", dest.display());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(DownloadError::from_transport)?;

        if !response.status().is_success() {
            log::error!("Download failed with status {} for {}", response.status(), url);
            return Err(DownloadError::Http(response.status()));
        }

        let total = response.content_length().filter(|t| *t > 0);
        if let Some(total) = total {
            log::info!("Total size: {:.1} MB", total as f64 / MIB);
        }

        let mut file = fs::File::create(dest).await.map_err(io_err)?;
        let mut pending: Vec<u8> = Vec::with_capacity(BLOCK_SIZE);
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    log::error!("Download error for {}: {:?}", url, e);
                    let _ = file.write_all(&pending).await;
                    let _ = file.flush().await;
                    return Err(DownloadError::from_transport(e));
                }
            };

            let mut rest: &[u8] = &chunk;
            while !rest.is_empty() {
                let take = (BLOCK_SIZE - pending.len()).min(rest.len());
                pending.extend_from_slice(&rest[..take]);
                rest = &rest[take..];

                if pending.len() == BLOCK_SIZE {
                    file.write_all(&pending).await.map_err(io_err)?;
                    written += pending.len() as u64;
                    pending.clear();
                    if let Some(total) = total {
                        on_progress(DownloadProgress::new(written, total));
                    }
                }
            }
        }

        if !pending.is_empty() {
            file.write_all(&pending).await.map_err(io_err)?;
            written += pending.len() as u64;
            if let Some(total) = total {
                on_progress(DownloadProgress::new(written, total));
            }
        }
        file.flush().await.map_err(io_err)?;

        log::info!(
            "Download completed: {} ({:.1} MB)",
            dest.display(),
            written as f64 / MIB
        );
        Ok(true)
    }

    /// Download a repository file into `store`, named after `output_name` or
    /// the last segment of the repository file name. An existing file is
    /// returned as-is unless `force` is set.
    pub async fn download_model<F>(
        &self,
        store: &ModelStore,
        repo: &str,
        file: &str,
        revision: &str,
        force: bool,
        output_name: Option<&str>,
        on_progress: F,
    ) -> Result<PathBuf, DownloadError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let default_name = file.rsplit('/').next().unwrap_or(file);
        let name = artifact_name(output_name.unwrap_or(default_name))?;
        let dest = store.artifact_path(&name);
        if dest.is_file() && !force {
            log::info!("Model already present: {}", dest.display());
            return Ok(dest);
        }
        let url = self.repo_file_url(repo, file, revision);
        self.fetch(&url, &dest, force, on_progress).await?;
        Ok(dest)
    }

    pub async fn download_entry<F>(
        &self,
        store: &ModelStore,
        entry: &CatalogEntry,
        force: bool,
        on_progress: F,
    ) -> Result<PathBuf, DownloadError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        self.download_model(store, entry.repo, entry.file, DEFAULT_REVISION, force, None, on_progress)
            .await
    }

    pub async fn download_recommended<F>(
        &self,
        store: &ModelStore,
        force: bool,
        on_progress: F,
    ) -> Result<PathBuf, DownloadError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        self.download_entry(store, recommended_model(), force, on_progress)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ok_response, serve, status_response, unsized_response};
    use std::sync::Arc;

    const TEN_MIB: usize = 10 * 1024 * 1024;

    #[test]
    fn hub_urls() {
        assert_eq!(
            build_url("TheBloke/phi-2-GGUF", "phi-2.Q4_K_M.gguf", "main"),
            "https://huggingface.co/TheBloke/phi-2-GGUF/resolve/main/phi-2.Q4_K_M.gguf"
        );
        assert_eq!(
            build_url(" /Qwen/Qwen2-0.5B-Instruct-GGUF/ ", "q.gguf", "v1"),
            "https://huggingface.co/Qwen/Qwen2-0.5B-Instruct-GGUF/resolve/v1/q.gguf"
        );
        assert_eq!(
            build_url("gpt2", "model.gguf", "main"),
            "https://huggingface.co/gpt2/gpt2/resolve/main/model.gguf"
        );
    }

    #[test]
    fn file_names_from_urls() {
        assert_eq!(
            file_name_from_url("https://example.com/models/tiny.Q4.gguf?download=true"),
            "tiny.Q4.gguf"
        );
        assert_eq!(file_name_from_url("https://example.com/a/b/"), "b");
        assert_eq!(file_name_from_url("not a url/weights?x=1"), "weights");
    }

    #[test]
    fn extension_appended_once() {
        assert_eq!(ensure_extension("model"), "model.gguf");
        assert_eq!(ensure_extension("model.gguf"), "model.gguf");
        assert_eq!(ensure_extension("Model.GGUF"), "Model.GGUF");
        assert_eq!(ensure_extension("model.bin"), "model.bin.gguf");
    }

    #[test]
    fn artifact_names_stay_in_the_models_directory() {
        assert_eq!(artifact_name("tiny").unwrap(), "tiny.gguf");
        assert_eq!(artifact_name("tiny.GGUF").unwrap(), "tiny.GGUF");
        for bad in ["", ".", "..", "../x", "sub/x.gguf", "..\\x", "/etc/x"] {
            assert!(
                matches!(artifact_name(bad), Err(DownloadError::InvalidName(n)) if n == bad),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(DownloadProgress::new(5, 10).percent, 50.0);
        assert_eq!(DownloadProgress::new(20, 10).percent, 100.0);
        assert_eq!(DownloadProgress::new(1024 * 1024, 0).percent, 0.0);
        assert_eq!(DownloadProgress::new(1024 * 1024, 0).downloaded_mib, 1.0);
    }

    #[tokio::test]
    async fn ten_mib_download_reports_increasing_progress() {
        let payload = Arc::new(vec![7u8; TEN_MIB]);
        let body = payload.clone();
        let server = serve(move |_| ok_response("application/octet-stream", &body)).await;
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("nested").join("fake.gguf");

        let mut seen = Vec::new();
        let downloaded = Downloader::new()
            .unwrap()
            .fetch(&server.url("/fake.gguf"), &dest, false, |p| seen.push(p))
            .await
            .unwrap();

        assert!(downloaded);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), TEN_MIB as u64);
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[1].percent > w[0].percent));
        let last = seen.last().unwrap();
        assert_eq!(last.percent, 100.0);
        assert_eq!(last.total_mib, 10.0);
        assert_eq!(last.downloaded_mib, 10.0);

        let request = &server.requests()[0];
        assert!(request.to_ascii_lowercase().contains("user-agent: contour-llm-download/1.0"));
    }

    #[tokio::test]
    async fn existing_destination_is_not_transferred_again() {
        let server = serve(|_| ok_response("application/octet-stream", b"GGUF-weights")).await;
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("m.gguf");
        let downloader = Downloader::new().unwrap();
        let url = server.url("/m.gguf");

        assert!(downloader.fetch(&url, &dest, false, |_| {}).await.unwrap());
        assert!(!downloader.fetch(&url, &dest, false, |_| {}).await.unwrap());
        assert_eq!(server.hits(), 1);

        assert!(downloader.fetch(&url, &dest, true, |_| {}).await.unwrap());
        assert_eq!(server.hits(), 2);
        assert_eq!(std::fs::read(&dest).unwrap(), b"GGUF-weights");
    }

    #[tokio::test]
    async fn unknown_length_skips_progress() {
        let server = serve(|_| unsized_response(&[1u8; 3000])).await;
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("u.gguf");

        let mut calls = 0;
        Downloader::new()
            .unwrap()
            .fetch(&server.url("/u.gguf"), &dest, false, |_| calls += 1)
            .await
            .unwrap();

        assert_eq!(calls, 0);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 3000);
    }

    #[tokio::test]
    async fn http_error_does_not_create_file() {
        let server = serve(|_| status_response("404 Not Found", "Entry not found")).await;
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("missing.gguf");

        let err = Downloader::new()
            .unwrap()
            .fetch(&server.url("/missing.gguf"), &dest, false, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Http(s) if s.as_u16() == 404));
        assert!(!err.is_certificate());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let tmp = tempfile::tempdir().unwrap();

        let err = Downloader::new()
            .unwrap()
            .fetch(&format!("http://{}/x.gguf", addr), &tmp.path().join("x.gguf"), false, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Network(_)));
    }

    #[tokio::test]
    async fn download_model_resolves_repo_and_name() {
        let server = serve(|_| ok_response("application/octet-stream", b"GGUF")).await;
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path().join("models"));
        let downloader = Downloader::new().unwrap().with_hub(server.url(""));

        let path = downloader
            .download_model(&store, "owner/repo", "weights.gguf", "dev", false, Some("renamed"), |_| {})
            .await
            .unwrap();

        assert_eq!(path, store.resolve_directory().join("renamed.gguf"));
        assert!(path.is_file());
        assert!(server.requests()[0].starts_with("GET /owner/repo/resolve/dev/weights.gguf "));

        let again = downloader
            .download_model(&store, "owner/repo", "weights.gguf", "dev", false, Some("renamed"), |_| {})
            .await
            .unwrap();
        assert_eq!(again, path);
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn escaping_output_name_is_refused_before_any_request() {
        let server = serve(|_| ok_response("application/octet-stream", b"GGUF")).await;
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path().join("models"));
        let downloader = Downloader::new().unwrap().with_hub(server.url(""));

        let err = downloader
            .download_model(&store, "owner/repo", "weights.gguf", "main", false, Some("../x"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidName(_)));
        assert!(!tmp.path().join("x.gguf").exists());
        assert_eq!(server.hits(), 0);

        let path = downloader
            .download_model(&store, "owner/repo", "q4/weights.gguf", "main", false, None, |_| {})
            .await
            .unwrap();
        assert_eq!(path, store.resolve_directory().join("weights.gguf"));
    }
}
