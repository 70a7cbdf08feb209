//! Turns an uploaded `.apk` or `.aab` into an installable, optionally signed
//! `.apk` using the Android build tools.

use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Keystore, PackagingConfig};

const TOOL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub(crate) enum PackagingError {
    #[error("unsupported package {0:?}, expected an .apk or .aab file")]
    Unsupported(String),
    #[error("conversion failed: {0}")]
    Conversion(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("could not read the package id: {0}")]
    Inspection(String),
    #[error("packaging i/o: {0}")]
    Io(String),
}

impl From<io::Error> for PackagingError {
    fn from(err: io::Error) -> Self {
        PackagingError::Io(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PackageKind {
    Apk,
    Aab,
}

impl PackageKind {
    fn from_file_name(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name).extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "apk" => Some(PackageKind::Apk),
            "aab" => Some(PackageKind::Aab),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Installable {
    pub(crate) file_name: String,
    pub(crate) data: Vec<u8>,
    pub(crate) package_id: String,
}

#[tonic::async_trait]
pub(crate) trait Packager: Send + Sync {
    async fn produce_installable(
        &self,
        file_name: &str,
        data: Vec<u8>,
        sign: bool,
    ) -> Result<Installable, PackagingError>;
}

pub(crate) struct ApkTools {
    config: PackagingConfig,
}

impl ApkTools {
    pub(crate) fn new(config: PackagingConfig) -> Self {
        Self { config }
    }

    fn keystore(&self) -> Result<&Keystore, PackagingError> {
        let keystore = self.config.keystore.as_ref().ok_or_else(|| {
            PackagingError::Signing(
                "set VTS_KEYSTORE_FILE, VTS_KEYSTORE_PASS and VTS_KEYSTORE_KEY_ALIAS".into(),
            )
        })?;
        if !keystore.file.is_file() {
            return Err(PackagingError::Signing(format!(
                "keystore {} not found",
                keystore.file.display()
            )));
        }
        Ok(keystore)
    }

    async fn build(
        &self,
        work: &Path,
        kind: PackageKind,
        data: Vec<u8>,
        sign: bool,
    ) -> Result<(PathBuf, String), PackagingError> {
        let keystore = if sign { Some(self.keystore()?) } else { None };

        let apk = match kind {
            PackageKind::Apk => {
                let input = work.join("input.apk");
                tokio::fs::write(&input, &data).await?;
                match keystore {
                    Some(keystore) => self.align_and_sign(work, &input, keystore).await?,
                    None => input,
                }
            }
            PackageKind::Aab => {
                let input = work.join("input.aab");
                tokio::fs::write(&input, &data).await?;
                self.bundle_to_apk(work, &input, keystore).await?
            }
        };

        let package_id = self.package_id(&apk).await?;
        Ok((apk, package_id))
    }

    /// bundletool signs the universal apk itself when given a keystore.
    async fn bundle_to_apk(
        &self,
        work: &Path,
        bundle: &Path,
        keystore: Option<&Keystore>,
    ) -> Result<PathBuf, PackagingError> {
        let jar = self.config.bundletool_jar.as_ref().ok_or_else(|| {
            PackagingError::Conversion("VTS_BUNDLETOOL_JAR is not set".into())
        })?;
        let apks = work.join("output.apks");
        let mut args = vec![
            "-jar".to_string(),
            jar.to_string_lossy().to_string(),
            "build-apks".into(),
            "--bundle".into(),
            bundle.to_string_lossy().to_string(),
            "--output".into(),
            apks.to_string_lossy().to_string(),
            "--mode".into(),
            "universal".into(),
        ];
        if let Some(keystore) = keystore {
            args.extend(keystore.args());
        }
        run_tool(&self.config.java, &args)
            .await
            .map_err(PackagingError::Conversion)?;

        let universal = work.join("universal.apk");
        let (source, dest) = (apks.clone(), universal.clone());
        tokio::task::spawn_blocking(move || extract_universal(&source, &dest))
            .await
            .map_err(|e| PackagingError::Conversion(format!("extraction task failed: {e}")))??;
        Ok(universal)
    }

    async fn align_and_sign(
        &self,
        work: &Path,
        apk: &Path,
        keystore: &Keystore,
    ) -> Result<PathBuf, PackagingError> {
        let aligned = work.join("aligned.apk");
        let args = [
            "-p".to_string(),
            "4".into(),
            apk.to_string_lossy().to_string(),
            aligned.to_string_lossy().to_string(),
        ];
        run_tool(&self.config.zipalign, &args)
            .await
            .map_err(|e| PackagingError::Signing(format!("zipalign: {e}")))?;

        let signed = work.join("signed.apk");
        let mut args = vec!["sign".to_string()];
        args.extend(keystore.args());
        args.push("--out".into());
        args.push(signed.to_string_lossy().to_string());
        args.push(aligned.to_string_lossy().to_string());
        run_tool(&self.config.apksigner, &args)
            .await
            .map_err(PackagingError::Signing)?;

        if !signed.is_file() {
            return Err(PackagingError::Signing(format!(
                "apksigner produced no {}",
                signed.display()
            )));
        }
        Ok(signed)
    }

    async fn package_id(&self, apk: &Path) -> Result<String, PackagingError> {
        let args = [
            "dump".to_string(),
            "badging".into(),
            apk.to_string_lossy().to_string(),
        ];
        let output = run_tool(&self.config.aapt2, &args)
            .await
            .map_err(PackagingError::Inspection)?;
        parse_badging_package(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| PackagingError::Inspection("aapt2 reported no package name".into()))
    }
}

#[tonic::async_trait]
impl Packager for ApkTools {
    async fn produce_installable(
        &self,
        file_name: &str,
        data: Vec<u8>,
        sign: bool,
    ) -> Result<Installable, PackagingError> {
        let kind = PackageKind::from_file_name(file_name)
            .ok_or_else(|| PackagingError::Unsupported(file_name.to_string()))?;
        if data.is_empty() {
            return Err(PackagingError::Conversion("package is empty".into()));
        }

        let work = self.config.work_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&work).await?;
        let built = self.build(&work, kind, data, sign).await;
        let result = match built {
            Ok((apk, package_id)) => tokio::fs::read(&apk)
                .await
                .map(|data| (data, package_id))
                .map_err(PackagingError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = tokio::fs::remove_dir_all(&work).await {
            warn!(dir = %work.display(), "failed to remove packaging work dir: {err}");
        }

        let (data, package_id) = result?;
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("package");
        info!(package = %package_id, size = data.len(), signed = sign, "package ready");
        Ok(Installable {
            file_name: format!("{stem}.apk"),
            data,
            package_id,
        })
    }
}

/// Runs a build tool and returns its output, or a printable failure.
async fn run_tool(program: &Path, args: &[String]) -> Result<Output, String> {
    debug!(tool = %program.display(), "running build tool");
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let output = match tokio::time::timeout(TOOL_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
            return Err(format!("{} not found", program.display()))
        }
        Ok(Err(err)) => return Err(format!("{}: {err}", program.display())),
        Err(_) => {
            return Err(format!(
                "{} timed out after {}s",
                program.display(),
                TOOL_TIMEOUT.as_secs()
            ))
        }
    };
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Err(format!(
            "{} exited with {}: {detail}",
            program.display(),
            output.status.code().unwrap_or(-1)
        ))
    }
}

fn extract_universal(apks: &Path, dest: &Path) -> Result<(), PackagingError> {
    let file = std::fs::File::open(apks)
        .map_err(|e| PackagingError::Conversion(format!("open {}: {e}", apks.display())))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| PackagingError::Conversion(format!("read {}: {e}", apks.display())))?;
    let mut entry = archive
        .by_name("universal.apk")
        .map_err(|_| PackagingError::Conversion("bundletool output has no universal.apk".into()))?;
    let mut out = std::fs::File::create(dest)?;
    io::copy(&mut entry, &mut out)?;
    Ok(())
}

/// Pulls the package name out of `aapt2 dump badging` output.
fn parse_badging_package(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.starts_with("package:"))
        .find_map(|line| {
            let rest = line.split("name='").nth(1)?;
            let name = rest.split('\'').next()?;
            (!name.is_empty()).then(|| name.to_string())
        })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::{write::FileOptions, ZipWriter};

    use super::*;

    fn tools(work_dir: PathBuf, keystore: Option<Keystore>) -> ApkTools {
        ApkTools::new(PackagingConfig {
            java: PathBuf::from("java"),
            bundletool_jar: None,
            zipalign: PathBuf::from("zipalign"),
            apksigner: PathBuf::from("apksigner"),
            aapt2: PathBuf::from("aapt2"),
            keystore,
            work_dir,
        })
    }

    #[test]
    fn badging_package_name_is_parsed() {
        let output = "\
package: name='com.example.app' versionCode='42' versionName='1.4.2' platformBuildVersionName='14'
sdkVersion:'24'
application-label:'Example'
";
        assert_eq!(
            parse_badging_package(output),
            Some("com.example.app".to_string())
        );
        assert_eq!(parse_badging_package("sdkVersion:'24'\n"), None);
        assert_eq!(parse_badging_package("package: name='' versionCode='1'\n"), None);
    }

    #[test]
    fn package_kind_follows_extension() {
        assert_eq!(PackageKind::from_file_name("a.apk"), Some(PackageKind::Apk));
        assert_eq!(PackageKind::from_file_name("b.AAB"), Some(PackageKind::Aab));
        assert_eq!(PackageKind::from_file_name("c.zip"), None);
        assert_eq!(PackageKind::from_file_name("noext"), None);
    }

    #[test]
    fn universal_apk_is_extracted_from_apks() {
        let dir = tempfile::tempdir().unwrap();
        let apks = dir.path().join("out.apks");
        let mut zip = ZipWriter::new(std::fs::File::create(&apks).unwrap());
        zip.start_file("toc.pb", FileOptions::default()).unwrap();
        zip.write_all(b"toc").unwrap();
        zip.start_file("universal.apk", FileOptions::default()).unwrap();
        zip.write_all(b"PK-universal").unwrap();
        zip.finish().unwrap();

        let dest = dir.path().join("universal.apk");
        extract_universal(&apks, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"PK-universal");

        let empty = dir.path().join("empty.apks");
        let mut zip = ZipWriter::new(std::fs::File::create(&empty).unwrap());
        zip.finish().unwrap();
        assert!(matches!(
            extract_universal(&empty, &dir.path().join("x.apk")),
            Err(PackagingError::Conversion(_))
        ));
    }

    #[tokio::test]
    async fn rejects_before_running_any_tool() {
        let dir = tempfile::tempdir().unwrap();
        let packager = tools(dir.path().join("work"), None);

        assert!(matches!(
            packager
                .produce_installable("notes.txt", b"x".to_vec(), false)
                .await,
            Err(PackagingError::Unsupported(_))
        ));
        assert!(matches!(
            packager
                .produce_installable("app.apk", b"PK".to_vec(), true)
                .await,
            Err(PackagingError::Signing(_))
        ));
        assert!(matches!(
            packager
                .produce_installable("app.aab", b"PK".to_vec(), false)
                .await,
            Err(PackagingError::Conversion(_))
        ));
        // Work dirs are cleaned up on failure.
        let leftovers = std::fs::read_dir(dir.path().join("work"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }
}
