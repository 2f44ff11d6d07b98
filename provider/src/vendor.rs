//! Downloaded helper artifacts.
//!
//! `vendor/` caches the on-device binaries and helper APKs by exact filename;
//! `tmp/<platform>/` caches HTTP install downloads keyed by the md5 of their
//! URL. Both directories are content-addressed and safe to delete.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::{Platform, ProviderError, Result};

pub const AGENT_VERSION: &str = "0.10.0";
pub const SCRCPY_VERSION: &str = "1.24";
const UIAUTOMATOR_VERSION: &str = "2.3.3";
const WHATSINPUT_VERSION: &str = "1.0";

const GITHUB_HOST: &str = "https://github.com";
const GITHUB_MIRROR: &str = "http://tool.appetizer.io";

/// A helper APK together with the manifest identity used for the
/// install-only-if-version-differs check. The versions are fixed by the
/// pinned release URLs.
#[derive(Debug, Clone, Copy)]
pub struct ApkArtifact {
    pub package: &'static str,
    pub version_code: u32,
    pub version_name: &'static str,
    pub file_name: &'static str,
    pub url: &'static str,
}

pub const HELPER_APKS: &[ApkArtifact] = &[
    ApkArtifact {
        package: "com.github.uiautomator",
        version_code: 233,
        version_name: "2.3.3",
        file_name: "app-uiautomator-2.3.3.apk",
        url: "https://github.com/openatx/android-uiautomator-server/releases/download/2.3.3/app-uiautomator.apk",
    },
    ApkArtifact {
        package: "com.github.uiautomator.test",
        version_code: 233,
        version_name: "2.3.3",
        file_name: "app-uiautomator-test-2.3.3.apk",
        url: "https://github.com/openatx/android-uiautomator-server/releases/download/2.3.3/app-uiautomator-test.apk",
    },
    ApkArtifact {
        package: "com.github.whatsinput",
        version_code: 1,
        version_name: "1.0",
        file_name: "WhatsInput-1.0.apk",
        url: "https://github.com/openatx/atxserver2-android-provider/releases/download/v0.2.0/WhatsInput_v1.0.apk",
    },
];

fn vendor_dir() -> PathBuf {
    PathBuf::from("vendor")
}

/// `tmp/<platform>/cache-<md5(url)>` path for an install download.
pub fn cache_path(platform: Platform, url: &str) -> PathBuf {
    let digest = md5::compute(url.as_bytes());
    let suffix = match platform {
        Platform::Android => "",
        Platform::Ios => ".ipa",
    };
    PathBuf::from("tmp")
        .join(platform.dir_name())
        .join(format!("cache-{digest:x}{suffix}"))
}

/// Downloads `url` into the platform cache unless already present.
pub async fn cache_download(platform: Platform, url: &str) -> Result<PathBuf> {
    let target = cache_path(platform, url);
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return Ok(target);
    }
    download(url, &target).await?;
    Ok(target)
}

/// The on-device agent binary for one ABI family, extracted from the release
/// archive on first use.
pub async fn agent_binary(arch: &str) -> Result<PathBuf> {
    let target = vendor_dir().join(format!("atx-agent-{AGENT_VERSION}-{arch}"));
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return Ok(target);
    }

    let url = format!(
        "{GITHUB_HOST}/openatx/atx-agent/releases/download/{AGENT_VERSION}/atx-agent_{AGENT_VERSION}_linux_{arch}.tar.gz"
    );
    let archive = vendor_dir().join(format!("atx-agent_{AGENT_VERSION}_linux_{arch}.tar.gz"));
    mirror_download(&url, &archive).await?;

    let bytes = tokio::fs::read(&archive).await?;
    let binary = tokio::task::spawn_blocking(move || extract_tar_gz_member(&bytes, "atx-agent"))
        .await
        .map_err(|e| ProviderError::Download(e.to_string()))??;

    write_atomic(&target, &binary).await?;
    let _ = tokio::fs::remove_file(&archive).await;
    Ok(target)
}

pub async fn scrcpy_server() -> Result<PathBuf> {
    let target = vendor_dir().join(format!("scrcpy-server-v{SCRCPY_VERSION}"));
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return Ok(target);
    }
    let url = format!(
        "{GITHUB_HOST}/Genymobile/scrcpy/releases/download/v{SCRCPY_VERSION}/scrcpy-server-v{SCRCPY_VERSION}"
    );
    mirror_download(&url, &target).await?;
    Ok(target)
}

/// Every helper APK with its cached path.
pub async fn helper_apks() -> Result<Vec<(&'static ApkArtifact, PathBuf)>> {
    let mut out = Vec::with_capacity(HELPER_APKS.len());
    for artifact in HELPER_APKS {
        let target = vendor_dir().join(artifact.file_name);
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            mirror_download(artifact.url, &target).await?;
        }
        out.push((artifact, target));
    }
    Ok(out)
}

/// Pre-fetches everything the Android prep pipeline needs, so the first
/// device attach does not pay the download cost.
pub async fn fetch_android() -> Result<()> {
    for arch in ["386", "armv6", "armv7"] {
        agent_binary(arch).await?;
    }
    scrcpy_server().await?;
    helper_apks().await?;
    Ok(())
}

/// Tries the GitHub mirror first for GitHub-hosted artifacts, falling back
/// to the origin.
async fn mirror_download(url: &str, target: &Path) -> Result<()> {
    if let Some(path) = url.strip_prefix(GITHUB_HOST) {
        let mirror_url = format!("{GITHUB_MIRROR}{path}");
        match download(&mirror_url, target).await {
            Ok(()) => return Ok(()),
            Err(e) => log::debug!("mirror download failed ({}), using origin", e),
        }
    }
    download(url, target).await
}

async fn download(url: &str, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let response = reqwest::get(url)
        .await
        .map_err(|e| ProviderError::Download(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ProviderError::Download(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }
    let expected = response.content_length();

    log::debug!("downloading {} to {}", url, target.display());
    let part = part_path(target);
    let mut file = tokio::fs::File::create(&part).await?;
    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProviderError::Download(e.to_string()))?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    if let Some(expected) = expected {
        if written != expected {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(ProviderError::Download(format!(
                "size mismatch for {url}: got {written}, expected {expected}"
            )));
        }
    }

    tokio::fs::rename(&part, target).await?;
    Ok(())
}

async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(target);
    tokio::fs::write(&part, bytes).await?;
    tokio::fs::rename(&part, target).await?;
    Ok(())
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

fn extract_tar_gz_member(bytes: &[u8], member: &str) -> Result<Vec<u8>> {
    use std::io::Read;

    let gz = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(gz);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.ends_with(member) {
            let mut out = Vec::new();
            entry.read_to_end(&mut out)?;
            return Ok(out);
        }
    }
    Err(ProviderError::Download(format!("{member} missing from archive")))
}

/// Marker file names kept around purely so operators can tell which versions
/// a vendor directory holds.
pub fn describe_versions() -> String {
    format!(
        "agent {AGENT_VERSION}, scrcpy-server {SCRCPY_VERSION}, uiautomator {UIAUTOMATOR_VERSION}, whatsinput {WHATSINPUT_VERSION}"
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_paths_are_url_hashed_and_platform_scoped() {
        let a = cache_path(Platform::Android, "http://example.com/a.apk");
        let b = cache_path(Platform::Android, "http://example.com/b.apk");
        assert_ne!(a, b);
        assert!(a.starts_with("tmp/android"));

        let ios = cache_path(Platform::Ios, "http://example.com/a.ipa");
        assert!(ios.starts_with("tmp/apple"));
        assert!(ios.to_string_lossy().ends_with(".ipa"));

        // Same URL, same key.
        assert_eq!(a, cache_path(Platform::Android, "http://example.com/a.apk"));
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("vendor/scrcpy-server-v1.24")),
            PathBuf::from("vendor/scrcpy-server-v1.24.part")
        );
    }
}
