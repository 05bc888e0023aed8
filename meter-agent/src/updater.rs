//! Program updates from a version manifest
//!
//! Features:
//! - Fetch a JSON manifest (`version`, `firmware_url`, optional `sha256`)
//! - Compare against the running version (numeric or lexical ordering)
//! - Download, verify and atomically replace the installed program
//!
//! Check failures are logged and swallowed; install failures leave the current
//! program in place.

use crate::config::{RestartPolicy, UpdateConfig, VersionOrdering};
use crate::error::{AgentError, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateManifest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub firmware_url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// A newer program advertised by the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOffer {
    pub version: String,
    pub firmware_url: String,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Installed {
    pub version: String,
    pub bytes: usize,
}

pub struct AgentUpdater {
    client: reqwest::Client,
    config: UpdateConfig,
    current_version: String,
}

impl AgentUpdater {
    pub fn new(config: UpdateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(concat!("meter-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            current_version: CURRENT_VERSION.to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_current_version(mut self, version: &str) -> Self {
        self.current_version = version.to_string();
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.manifest_url.trim().is_empty()
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.config.restart
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.config.check_interval_secs)
    }

    /// Fetch the manifest and return an offer when it advertises a newer version.
    pub async fn check_for_update(&self) -> Option<UpdateOffer> {
        if !self.is_enabled() {
            return None;
        }

        info!("Checking for updates...");
        let manifest = match self.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Update check failed: {}", e);
                return None;
            }
        };

        let offer = evaluate_manifest(&manifest, &self.current_version, self.config.ordering);
        match &offer {
            Some(offer) => info!(
                "Update available: {} -> {}",
                self.current_version, offer.version
            ),
            None => debug!(
                "No update (current {}, manifest {:?})",
                self.current_version, manifest.version
            ),
        }
        offer
    }

    async fn fetch_manifest(&self) -> Result<UpdateManifest> {
        let response = self.client.get(&self.config.manifest_url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::Connectivity(format!(
                "manifest fetch returned {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Download, verify and install the offered program over `program_path`.
    ///
    /// A successful install becomes the current version, so the same manifest is not
    /// offered again while this process keeps running.
    pub async fn apply_update(&mut self, offer: &UpdateOffer) -> Result<Installed> {
        info!("Performing update to version {}", offer.version);

        if self.config.require_checksum && offer.sha256.is_none() {
            return Err(AgentError::Integrity {
                expected: "sha256 in manifest".to_string(),
                actual: "none".to_string(),
            });
        }

        let body = self.download(&offer.firmware_url).await?;
        if body.is_empty() {
            return Err(AgentError::Parse("downloaded program is empty".to_string()));
        }
        if let Some(expected) = &offer.sha256 {
            verify_digest(&body, expected)?;
        }

        install(&body, &self.config.program_path).await?;
        info!("Replaced {}", self.config.program_path.display());
        self.current_version = offer.version.clone();

        Ok(Installed {
            version: offer.version.clone(),
            bytes: body.len(),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::Connectivity(format!(
                "download returned {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Offer only for a complete manifest whose version is newer than `current`.
pub fn evaluate_manifest(
    manifest: &UpdateManifest,
    current: &str,
    ordering: VersionOrdering,
) -> Option<UpdateOffer> {
    let version = manifest.version.as_deref().map(str::trim).filter(|v| !v.is_empty())?;
    let firmware_url = manifest
        .firmware_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())?;

    if !is_newer_version(current, version, ordering) {
        return None;
    }

    Some(UpdateOffer {
        version: version.to_string(),
        firmware_url: firmware_url.to_string(),
        sha256: manifest.sha256.clone(),
    })
}

pub fn is_newer_version(current: &str, latest: &str, ordering: VersionOrdering) -> bool {
    match ordering {
        VersionOrdering::Lexical => latest > current,
        VersionOrdering::Numeric => is_newer_numeric(current, latest),
    }
}

fn is_newer_numeric(current: &str, latest: &str) -> bool {
    let parts = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|s| s.trim().parse().unwrap_or(0))
            .collect()
    };
    let mut current_parts = parts(current);
    let mut latest_parts = parts(latest);

    // missing components count as 0: "1.0" == "1.0.0"
    let len = current_parts.len().max(latest_parts.len());
    current_parts.resize(len, 0);
    latest_parts.resize(len, 0);

    latest_parts > current_parts
}

fn verify_digest(body: &[u8], expected: &str) -> Result<()> {
    let actual = format!("{:x}", Sha256::digest(body));
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(AgentError::Integrity {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(())
}

/// Write beside the target, then rename over it. The staging file never outlives a failure.
async fn install(body: &[u8], program_path: &Path) -> Result<()> {
    let file_name = program_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| AgentError::Parse(format!("invalid program path {}", program_path.display())))?;
    let staging = program_path.with_file_name(format!(".{}.{}.staging", file_name, uuid::Uuid::new_v4()));

    let result = stage_and_swap(body, program_path, &staging).await;
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            debug!("Staging cleanup for {}: {}", staging.display(), e);
        }
    }
    result
}

async fn stage_and_swap(body: &[u8], program_path: &Path, staging: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(staging).await?;
    file.write_all(body).await?;
    file.sync_all().await?;
    drop(file);

    match tokio::fs::metadata(program_path).await {
        Ok(existing) => tokio::fs::set_permissions(staging, existing.permissions()).await?,
        #[cfg(unix)]
        Err(_) => {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(staging, std::fs::Permissions::from_mode(0o755)).await?
        }
        #[cfg(not(unix))]
        Err(_) => {}
    }

    tokio::fs::rename(staging, program_path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_devkit::fixtures::manifest;
    use meter_devkit::HttpStub;
    use std::path::PathBuf;

    const PROGRAM: &[u8] = b"#!/bin/sh\necho new\n";

    fn sha256_hex(body: &[u8]) -> String {
        format!("{:x}", Sha256::digest(body))
    }

    fn config(stub: &HttpStub, program_path: PathBuf) -> UpdateConfig {
        UpdateConfig {
            manifest_url: stub.url("/version.json"),
            program_path,
            http_timeout_secs: 5,
            ..UpdateConfig::default()
        }
    }

    fn staging_leftovers(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.to_string_lossy().ends_with(".staging"))
            .collect()
    }

    #[test]
    fn test_version_comparison() {
        let numeric = VersionOrdering::Numeric;
        assert!(is_newer_version("1.0.0", "1.0.1", numeric));
        assert!(is_newer_version("1.0.0", "1.1.0", numeric));
        assert!(!is_newer_version("1.1.0", "1.0.0", numeric));
        assert!(!is_newer_version("1.0.0", "1.0.0", numeric));
        assert!(is_newer_version("1.9", "1.10", numeric));
        assert!(is_newer_version("1.0", "v1.0.1", numeric));
    }

    #[test]
    fn test_missing_components_count_as_zero() {
        let numeric = VersionOrdering::Numeric;
        assert!(!is_newer_version("1.0", "1.0.0", numeric));
        assert!(!is_newer_version("1.0.0", "1.0", numeric));
        assert!(is_newer_version("1.0", "1.0.0.1", numeric));
        assert!(!is_newer_version("2", "1.9.9", numeric));
    }

    #[test]
    fn test_lexical_ordering_keeps_string_semantics() {
        let lexical = VersionOrdering::Lexical;
        assert!(is_newer_version("1.0", "1.1", lexical));
        assert!(!is_newer_version("1.9", "1.10", lexical));
        assert!(!is_newer_version("1.0", "1.0", lexical));
    }

    #[test]
    fn test_incomplete_manifest_is_ignored() {
        let current = "1.0.0";
        let ordering = VersionOrdering::Numeric;
        let missing_url = UpdateManifest {
            version: Some("2.0.0".into()),
            ..UpdateManifest::default()
        };
        let empty_version = UpdateManifest {
            version: Some(" ".into()),
            firmware_url: Some("http://x/fw".into()),
            sha256: None,
        };

        assert_eq!(evaluate_manifest(&missing_url, current, ordering), None);
        assert_eq!(evaluate_manifest(&empty_version, current, ordering), None);
    }

    #[test]
    fn test_digest_verification() {
        assert!(verify_digest(PROGRAM, &sha256_hex(PROGRAM)).is_ok());
        assert!(verify_digest(PROGRAM, &sha256_hex(PROGRAM).to_uppercase()).is_ok());
        assert!(matches!(
            verify_digest(PROGRAM, &sha256_hex(b"other")),
            Err(AgentError::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn test_greater_version_is_downloaded_and_installed() {
        let stub = HttpStub::start().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("meter-agent");
        std::fs::write(&program, b"old").unwrap();

        let doc = manifest("1.1.0", &stub.url("/fw.bin"), Some(sha256_hex(PROGRAM).as_str()));
        stub.route("/version.json", 200, doc.to_string());
        stub.route("/fw.bin", 200, PROGRAM);

        let mut updater = AgentUpdater::new(config(&stub, program.clone()))
            .unwrap()
            .with_current_version("1.0.0");
        let offer = updater.check_for_update().await.unwrap();
        assert_eq!(offer.version, "1.1.0");

        let installed = updater.apply_update(&offer).await.unwrap();
        assert_eq!(installed.version, "1.1.0");
        assert_eq!(installed.bytes, PROGRAM.len());
        assert_eq!(std::fs::read(&program).unwrap(), PROGRAM);
        assert_eq!(stub.hits("/fw.bin"), 1);
        assert!(staging_leftovers(dir.path()).is_empty());

        // the installed version is now current
        assert_eq!(updater.check_for_update().await, None);
    }

    #[tokio::test]
    async fn test_equal_or_older_version_downloads_nothing() {
        let stub = HttpStub::start().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let updater = AgentUpdater::new(config(&stub, dir.path().join("meter-agent")))
            .unwrap()
            .with_current_version("1.0.0");

        for version in ["1.0.0", "0.9.9"] {
            stub.route("/version.json", 200, manifest(version, &stub.url("/fw.bin"), None).to_string());
            assert_eq!(updater.check_for_update().await, None);
        }
        assert_eq!(stub.hits("/fw.bin"), 0);
    }

    #[tokio::test]
    async fn test_bad_manifests_are_swallowed() {
        let stub = HttpStub::start().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let updater = AgentUpdater::new(config(&stub, dir.path().join("meter-agent")))
            .unwrap()
            .with_current_version("1.0.0");

        stub.route("/version.json", 200, "{not json");
        assert_eq!(updater.check_for_update().await, None);

        stub.route("/version.json", 200, r#"{"version":"9.0.0"}"#);
        assert_eq!(updater.check_for_update().await, None);

        stub.route("/version.json", 500, "oops");
        assert_eq!(updater.check_for_update().await, None);

        stub.hangup("/version.json");
        assert_eq!(updater.check_for_update().await, None);
    }

    #[tokio::test]
    async fn test_disabled_without_manifest_url() {
        let stub = HttpStub::start().await.unwrap();
        let mut cfg = config(&stub, PathBuf::from("/nonexistent/meter-agent"));
        cfg.manifest_url = String::new();
        let updater = AgentUpdater::new(cfg).unwrap().with_current_version("0.0.1");

        assert!(!updater.is_enabled());
        assert_eq!(updater.check_for_update().await, None);
        assert_eq!(stub.hits("/version.json"), 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_keeps_current_program() {
        let stub = HttpStub::start().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("meter-agent");
        std::fs::write(&program, b"old").unwrap();
        stub.route("/fw.bin", 200, PROGRAM);

        let mut updater = AgentUpdater::new(config(&stub, program.clone()))
            .unwrap()
            .with_current_version("1.0.0");
        let offer = UpdateOffer {
            version: "9.9.9".into(),
            firmware_url: stub.url("/fw.bin"),
            sha256: Some(sha256_hex(b"something else")),
        };

        assert!(matches!(
            updater.apply_update(&offer).await,
            Err(AgentError::Integrity { .. })
        ));
        assert_eq!(std::fs::read(&program).unwrap(), b"old");
        assert!(staging_leftovers(dir.path()).is_empty());

        // a failed install leaves the offer open
        stub.route("/version.json", 200, manifest("9.9.9", &stub.url("/fw.bin"), None).to_string());
        assert!(updater.check_for_update().await.is_some());
    }

    #[tokio::test]
    async fn test_required_checksum_and_empty_body() {
        let stub = HttpStub::start().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("meter-agent");
        std::fs::write(&program, b"old").unwrap();
        stub.route("/empty.bin", 200, Vec::<u8>::new());

        let mut cfg = config(&stub, program.clone());
        cfg.require_checksum = true;
        let mut strict = AgentUpdater::new(cfg).unwrap();
        let offer = UpdateOffer {
            version: "9.9.9".into(),
            firmware_url: stub.url("/empty.bin"),
            sha256: None,
        };
        assert!(strict.apply_update(&offer).await.is_err());
        assert_eq!(stub.hits("/empty.bin"), 0);

        let mut lenient = AgentUpdater::new(config(&stub, program.clone())).unwrap();
        assert!(matches!(
            lenient.apply_update(&offer).await,
            Err(AgentError::Parse(_))
        ));
        assert_eq!(std::fs::read(&program).unwrap(), b"old");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_keeps_program_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("meter-agent");
        std::fs::write(&program, b"old").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o750)).unwrap();

        install(PROGRAM, &program).await.unwrap();

        let mode = std::fs::metadata(&program).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}
