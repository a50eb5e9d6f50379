//! Steps that run after a transfer has fully landed on disk.
//!
//! The pipeline is extraction, then disk-image conversion, then relocation to
//! secondary storage. Each stage is skipped when disabled, and a failing stage
//! only produces a [`PostProcessWarning`]: the transfer itself stays complete.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::config::Settings;
use crate::error::{CoreError, CoreResult, PostProcessWarning};
use crate::fsutil::{copy_recursive, has_extension, remove_path, walk_files};
use crate::record::TransferStatus;

pub trait ArchiveExtractor: Send + Sync {
    /// Whether `path` looks like an archive this extractor understands.
    fn handles(&self, path: &Path) -> bool;

    /// Unpacks `archive` into `dest_dir` and returns the number of files written.
    fn extract(&self, archive: &Path, dest_dir: &Path) -> CoreResult<usize>;
}

/// Extracts `.zip` archives, skipping entries that would escape the target.
#[derive(Debug, Default)]
pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn handles(&self, path: &Path) -> bool {
        has_extension(path, "zip")
    }

    fn extract(&self, archive: &Path, dest_dir: &Path) -> CoreResult<usize> {
        let file = File::open(archive).map_err(|err| CoreError::Io(err.to_string()))?;
        let mut zip = ZipArchive::new(file).map_err(|err| CoreError::Io(err.to_string()))?;
        fs::create_dir_all(dest_dir).map_err(|err| CoreError::Io(err.to_string()))?;

        let mut written = 0usize;
        for index in 0..zip.len() {
            let mut entry = zip
                .by_index(index)
                .map_err(|err| CoreError::Io(err.to_string()))?;
            let Some(relative) = entry.enclosed_name() else {
                warn!(name = entry.name(), "skipping archive entry outside the target");
                continue;
            };
            let out_path = dest_dir.join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&out_path).map_err(|err| CoreError::Io(err.to_string()))?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
            }
            let mut out = File::create(&out_path)
                .map_err(|err| CoreError::Io(format!("{}: {}", out_path.display(), err)))?;
            io::copy(&mut entry, &mut out).map_err(|err| CoreError::Io(err.to_string()))?;
            written += 1;
        }
        Ok(written)
    }
}

pub trait ImageConverter: Send + Sync {
    /// Converts one disk image, writing results under `output_dir`.
    fn convert(&self, image: &Path, output_dir: &Path) -> CoreResult<()>;
}

/// Runs `program args... <image> <output dir>`; exit code 0 means success.
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ExternalConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl ImageConverter for ExternalConverter {
    fn convert(&self, image: &Path, output_dir: &Path) -> CoreResult<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .arg(output_dir)
            .output()
            .map_err(|err| {
                CoreError::Io(format!("failed to run {}: {}", self.program.display(), err))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Io(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostProcessOptions {
    pub auto_extract: bool,
    pub auto_convert: bool,
    pub move_to_secondary: bool,
    pub secondary_root: Option<PathBuf>,
}

impl From<&Settings> for PostProcessOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            auto_extract: settings.auto_extract,
            auto_convert: settings.auto_convert,
            move_to_secondary: settings.move_to_secondary,
            secondary_root: settings.secondary_root.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcessReport {
    /// Where the result lives now: the download, its extraction directory, or
    /// the relocated copy of either.
    pub final_path: PathBuf,
    pub extracted_to: Option<PathBuf>,
    pub converted: Vec<PathBuf>,
    pub relocated: bool,
    pub warnings: Vec<PostProcessWarning>,
}

pub struct PostProcessor {
    extractor: Arc<dyn ArchiveExtractor>,
    image_extension: String,
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self::new(Arc::new(ZipExtractor))
    }
}

impl PostProcessor {
    pub fn new(extractor: Arc<dyn ArchiveExtractor>) -> Self {
        Self {
            extractor,
            image_extension: "iso".to_string(),
        }
    }

    /// Runs the enabled stages on `path`. `on_stage` is called on entry to each
    /// stage that actually runs.
    pub fn run(
        &self,
        path: &Path,
        options: &PostProcessOptions,
        converter: Option<&dyn ImageConverter>,
        on_stage: &mut dyn FnMut(TransferStatus),
    ) -> PostProcessReport {
        let mut report = PostProcessReport {
            final_path: path.to_path_buf(),
            extracted_to: None,
            converted: Vec::new(),
            relocated: false,
            warnings: Vec::new(),
        };

        if options.auto_extract && self.extractor.handles(path) {
            on_stage(TransferStatus::Extracting);
            self.extract_stage(path, &mut report);
        }

        if options.auto_convert {
            if let Some(dir) = report.extracted_to.clone() {
                on_stage(TransferStatus::Converting);
                self.convert_stage(&dir, converter, &mut report);
            }
        }

        if options.move_to_secondary {
            if let Some(root) = &options.secondary_root {
                on_stage(TransferStatus::Relocating);
                relocate_stage(root, &mut report);
            }
        }

        for warning in &report.warnings {
            warn!(%warning, "post-processing warning");
        }
        report
    }

    fn extract_stage(&self, archive: &Path, report: &mut PostProcessReport) {
        let target = strip_extension(archive);
        match self.extractor.extract(archive, &target) {
            Ok(files) => {
                info!(archive = %archive.display(), target = %target.display(), files, "archive extracted");
                if let Err(err) = fs::remove_file(archive) {
                    report.warnings.push(PostProcessWarning::Extraction {
                        path: archive.to_path_buf(),
                        reason: format!("could not delete archive: {}", err),
                    });
                }
                report.final_path = target.clone();
                report.extracted_to = Some(target);
            }
            Err(err) => report.warnings.push(PostProcessWarning::Extraction {
                path: archive.to_path_buf(),
                reason: err.to_string(),
            }),
        }
    }

    fn convert_stage(
        &self,
        dir: &Path,
        converter: Option<&dyn ImageConverter>,
        report: &mut PostProcessReport,
    ) {
        let Some(converter) = converter else {
            report.warnings.push(PostProcessWarning::Conversion {
                path: dir.to_path_buf(),
                reason: "no converter configured".to_string(),
            });
            return;
        };

        let mut images = Vec::new();
        for entry in walk_files(dir) {
            match entry {
                Ok(file) if has_extension(&file, &self.image_extension) => images.push(file),
                Ok(_) => {}
                Err(err) => report.warnings.push(PostProcessWarning::Conversion {
                    path: dir.to_path_buf(),
                    reason: err.to_string(),
                }),
            }
        }
        images.sort();
        debug!(dir = %dir.display(), images = images.len(), "converting disk images");

        for image in images {
            let output_dir = strip_extension(&image);
            match converter.convert(&image, &output_dir) {
                Ok(()) => {
                    info!(image = %image.display(), output = %output_dir.display(), "image converted");
                    if let Err(err) = fs::remove_file(&image) {
                        report.warnings.push(PostProcessWarning::Conversion {
                            path: image.clone(),
                            reason: format!("could not delete image: {}", err),
                        });
                    }
                    report.converted.push(output_dir);
                }
                Err(err) => report.warnings.push(PostProcessWarning::Conversion {
                    path: image,
                    reason: err.to_string(),
                }),
            }
        }
    }
}

fn relocate_stage(root: &Path, report: &mut PostProcessReport) {
    let source = report.final_path.clone();
    let Some(name) = source.file_name() else {
        report.warnings.push(PostProcessWarning::Relocation {
            path: source.clone(),
            reason: "path has no file name".to_string(),
        });
        return;
    };
    let target = root.join(name);
    if target.exists() {
        report.warnings.push(PostProcessWarning::Relocation {
            path: source,
            reason: format!("{} already exists", target.display()),
        });
        return;
    }
    match relocate(&source, &target) {
        Ok(()) => {
            info!(from = %source.display(), to = %target.display(), "relocated");
            report.final_path = target;
            report.relocated = true;
        }
        Err(err) => report.warnings.push(PostProcessWarning::Relocation {
            path: source,
            reason: err.to_string(),
        }),
    }
}

/// Moves a file or directory, falling back to copy and delete across devices.
pub fn relocate(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            debug!(from = %source.display(), "rename crosses devices, copying");
            if let Err(err) = copy_recursive(source, target) {
                let _ = remove_path(target);
                return Err(err);
            }
            remove_path(source)
        }
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(windows)]
fn is_cross_device(err: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    err.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_err: &io::Error) -> bool {
    false
}

/// `/a/game.zip` -> `/a/game`.
fn strip_extension(path: &Path) -> PathBuf {
    match path.file_stem() {
        Some(stem) => path.with_file_name(stem),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fixture.zip");
        write_zip(&path, entries);
        fs::read(path).unwrap()
    }

    fn run(
        path: &Path,
        options: &PostProcessOptions,
        converter: Option<&dyn ImageConverter>,
    ) -> (PostProcessReport, Vec<TransferStatus>) {
        let mut stages = Vec::new();
        let report = PostProcessor::default().run(
            path,
            options,
            converter,
            &mut |stage: TransferStatus| stages.push(stage),
        );
        (report, stages)
    }

    fn extract_only() -> PostProcessOptions {
        PostProcessOptions {
            auto_extract: true,
            ..PostProcessOptions::default()
        }
    }

    #[test]
    fn extracts_zip_and_deletes_archive() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("Game.ZIP");
        write_zip(&archive, &[("readme.txt", b"hi"), ("disc/game.iso", b"iso")]);

        let (report, stages) = run(&archive, &extract_only(), None);

        assert_eq!(stages, vec![TransferStatus::Extracting]);
        assert!(report.warnings.is_empty());
        let target = temp.path().join("Game");
        assert_eq!(report.final_path, target);
        assert_eq!(fs::read(target.join("disc").join("game.iso")).unwrap(), b"iso");
        assert!(!archive.exists());
    }

    #[test]
    fn disabled_pipeline_is_a_pass_through() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("game.zip");
        write_zip(&archive, &[("a.txt", b"a")]);

        let (report, stages) = run(&archive, &PostProcessOptions::default(), None);

        assert!(stages.is_empty());
        assert_eq!(report.final_path, archive);
        assert!(archive.exists());
    }

    #[test]
    fn non_archives_skip_extraction() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("movie.mkv");
        fs::write(&file, b"data").unwrap();

        let (report, stages) = run(&file, &extract_only(), None);

        assert!(stages.is_empty());
        assert_eq!(report.final_path, file);
    }

    #[test]
    fn corrupt_archive_is_a_warning() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("broken.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        let (report, stages) = run(&archive, &extract_only(), None);

        assert_eq!(stages, vec![TransferStatus::Extracting]);
        assert!(matches!(
            report.warnings.as_slice(),
            [PostProcessWarning::Extraction { .. }]
        ));
        assert_eq!(report.final_path, archive);
        assert!(archive.exists());
    }

    struct RecordingConverter {
        fail_on: Option<&'static str>,
    }

    impl ImageConverter for RecordingConverter {
        fn convert(&self, image: &Path, output_dir: &Path) -> CoreResult<()> {
            if self.fail_on.map(|name| image.ends_with(name)).unwrap_or(false) {
                return Err(CoreError::Io("converter exited with 3".to_string()));
            }
            fs::create_dir_all(output_dir).unwrap();
            fs::write(output_dir.join("default.xex"), b"xex").unwrap();
            Ok(())
        }
    }

    #[test]
    fn converts_every_image_and_isolates_failures() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("pack.zip");
        write_zip(
            &archive,
            &[("one/a.iso", b"a"), ("two/deeper/B.ISO", b"b"), ("notes.txt", b"n")],
        );
        let options = PostProcessOptions {
            auto_extract: true,
            auto_convert: true,
            ..PostProcessOptions::default()
        };
        let converter = RecordingConverter {
            fail_on: Some("B.ISO"),
        };

        let (report, stages) = run(&archive, &options, Some(&converter));

        assert_eq!(
            stages,
            vec![TransferStatus::Extracting, TransferStatus::Converting]
        );
        let root = temp.path().join("pack");
        assert!(root.join("one").join("a").join("default.xex").exists());
        assert!(!root.join("one").join("a.iso").exists());
        assert!(root.join("two").join("deeper").join("B.ISO").exists());
        assert_eq!(report.converted, vec![root.join("one").join("a")]);
        assert!(matches!(
            report.warnings.as_slice(),
            [PostProcessWarning::Conversion { .. }]
        ));
    }

    #[test]
    fn conversion_without_converter_warns() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("pack.zip");
        write_zip(&archive, &[("a.iso", b"a")]);
        let options = PostProcessOptions {
            auto_extract: true,
            auto_convert: true,
            ..PostProcessOptions::default()
        };

        let (report, _) = run(&archive, &options, None);

        assert_eq!(report.warnings.len(), 1);
        assert!(temp.path().join("pack").join("a.iso").exists());
    }

    #[test]
    fn conversion_needs_a_successful_extraction() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("disc.iso");
        fs::write(&file, b"iso").unwrap();
        let options = PostProcessOptions {
            auto_extract: true,
            auto_convert: true,
            ..PostProcessOptions::default()
        };
        let converter = RecordingConverter { fail_on: None };

        let (_, stages) = run(&file, &options, Some(&converter));

        assert!(stages.is_empty());
        assert!(file.exists());
    }

    #[cfg(unix)]
    #[test]
    fn external_converter_reports_exit_status() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("game.iso");
        fs::write(&image, b"iso").unwrap();
        let out = temp.path().join("game");

        let ok = ExternalConverter::new("sh").with_args([
            "-c",
            "mkdir -p \"$2\" && cp \"$1\" \"$2\"/out.xex",
            "convert",
        ]);
        ok.convert(&image, &out).unwrap();
        assert_eq!(fs::read(out.join("out.xex")).unwrap(), b"iso");

        let failing = ExternalConverter::new("sh").with_args(["-c", "exit 3"]);
        assert!(failing.convert(&image, &out).is_err());

        let missing = ExternalConverter::new(temp.path().join("no-such-converter"));
        assert!(missing.convert(&image, &out).is_err());
    }

    #[test]
    fn relocates_extraction_directory() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("downloads").join("game.zip");
        fs::create_dir_all(archive.parent().unwrap()).unwrap();
        write_zip(&archive, &[("a.txt", b"a")]);
        let secondary = temp.path().join("usb");
        let options = PostProcessOptions {
            auto_extract: true,
            move_to_secondary: true,
            secondary_root: Some(secondary.clone()),
            ..PostProcessOptions::default()
        };

        let (report, stages) = run(&archive, &options, None);

        assert_eq!(
            stages,
            vec![TransferStatus::Extracting, TransferStatus::Relocating]
        );
        assert!(report.relocated);
        assert_eq!(report.final_path, secondary.join("game"));
        assert!(secondary.join("game").join("a.txt").exists());
        assert!(!temp.path().join("downloads").join("game").exists());
    }

    #[test]
    fn relocation_refuses_to_overwrite() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("movie.mkv");
        fs::write(&file, b"new").unwrap();
        let secondary = temp.path().join("usb");
        fs::create_dir_all(&secondary).unwrap();
        fs::write(secondary.join("movie.mkv"), b"old").unwrap();
        let options = PostProcessOptions {
            move_to_secondary: true,
            secondary_root: Some(secondary.clone()),
            ..PostProcessOptions::default()
        };

        let (report, stages) = run(&file, &options, None);

        assert_eq!(stages, vec![TransferStatus::Relocating]);
        assert!(!report.relocated);
        assert_eq!(report.final_path, file);
        assert!(matches!(
            report.warnings.as_slice(),
            [PostProcessWarning::Relocation { .. }]
        ));
        assert_eq!(fs::read(secondary.join("movie.mkv")).unwrap(), b"old");
    }

    #[test]
    fn relocation_needs_a_secondary_root() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("movie.mkv");
        fs::write(&file, b"new").unwrap();
        let options = PostProcessOptions {
            move_to_secondary: true,
            ..PostProcessOptions::default()
        };

        let (report, stages) = run(&file, &options, None);

        assert!(stages.is_empty());
        assert_eq!(report.final_path, file);
    }
}
