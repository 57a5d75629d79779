use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::cli::InventoryArgs;
use crate::format::{Detection, FormatDetector, SNIFF_BYTE_LIMIT};
use crate::model::{DocumentEntry, DocumentInventoryManifest, DocumentKind};
use crate::util::{now_utc_string, read_leading_bytes, sha256_file, write_json_pretty};

pub const INVENTORY_MANIFEST_FILENAME: &str = "document_inventory.json";

pub fn run(args: InventoryArgs) -> Result<()> {
    let source_dir = args
        .source_dir
        .clone()
        .unwrap_or_else(|| args.cache_root.join("sources"));
    let manifest = build_manifest(&source_dir)?;

    if args.dry_run {
        info!(
            document_count = manifest.document_count,
            recognized = manifest.recognized_count,
            source = %manifest.source_directory,
            "inventory dry-run complete"
        );
        return Ok(());
    }

    let manifest_path = args.manifest_path.unwrap_or_else(|| {
        args.cache_root
            .join("manifests")
            .join(INVENTORY_MANIFEST_FILENAME)
    });

    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote inventory manifest");
    info!(
        document_count = manifest.document_count,
        recognized = manifest.recognized_count,
        "inventory completed"
    );

    Ok(())
}

pub fn build_manifest(source_dir: &Path) -> Result<DocumentInventoryManifest> {
    let detector = FormatDetector::new()?;

    let mut paths = discover_documents(source_dir)?;
    paths.sort_by(|a, b| a.0.cmp(&b.0));

    if paths.is_empty() {
        bail!("no relay documents found in {}", source_dir.display());
    }

    let mut documents = Vec::with_capacity(paths.len());
    for (path, kind) in paths {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)
            .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))?;

        // PDF bytes are binary; sniffing only helps for plain dumps.
        let leading = match kind {
            DocumentKind::KeyValue => read_leading_bytes(&path, SNIFF_BYTE_LIMIT)?,
            DocumentKind::Pdf => Vec::new(),
        };
        let (grammar, detected_via) = match detector.detect(&filename, &leading) {
            Detection::Recognized { grammar, via } => {
                debug!(
                    filename = %filename,
                    kind = kind.as_str(),
                    grammar = grammar.as_str(),
                    via = via.as_str(),
                    "format detected"
                );
                (Some(grammar), Some(via))
            }
            Detection::Unrecognized => {
                warn!(filename = %filename, "format not recognized from filename or content");
                (None, None)
            }
        };

        let byte_len = fs::metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        documents.push(DocumentEntry {
            sha256: sha256_file(&path)?,
            filename,
            kind,
            byte_len,
            grammar,
            detected_via,
        });
    }

    documents.sort_by(|a, b| a.filename.cmp(&b.filename));
    let recognized_count = documents
        .iter()
        .filter(|document| document.grammar.is_some())
        .count();

    Ok(DocumentInventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        source_directory: source_dir.display().to_string(),
        document_count: documents.len(),
        recognized_count,
        documents,
    })
}

fn discover_documents(source_dir: &Path) -> Result<Vec<(PathBuf, DocumentKind)>> {
    let mut documents = Vec::new();

    let entries = fs::read_dir(source_dir)
        .with_context(|| format!("failed to read {}", source_dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", source_dir.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        if let Some(kind) = DocumentKind::from_path(&path) {
            documents.push((path, kind));
        }
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{DetectionSource, Grammar};

    #[test]
    fn manifest_detects_grammar_by_name_then_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("P122_204-PN-06.pdf"), b"%PDF-1.4").expect("write pdf");
        fs::write(
            dir.path().join("feeder.txt"),
            b"Relay settings\nRID := FEEDER 12\nTID := SUB A\n",
        )
        .expect("write dump");
        fs::write(dir.path().join("notes.txt"), b"nothing to see here\n").expect("write notes");
        fs::write(dir.path().join("photo.jpg"), b"\xff\xd8").expect("write photo");

        let manifest = build_manifest(dir.path()).expect("manifest builds");
        assert_eq!(manifest.document_count, 3);
        assert_eq!(manifest.recognized_count, 2);

        let names = manifest
            .documents
            .iter()
            .map(|document| document.filename.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["P122_204-PN-06.pdf", "feeder.txt", "notes.txt"]);

        assert_eq!(manifest.documents[0].grammar, Some(Grammar::MicomP122));
        assert_eq!(
            manifest.documents[0].detected_via,
            Some(DetectionSource::Filename)
        );
        assert_eq!(manifest.documents[1].grammar, Some(Grammar::SelSettings));
        assert_eq!(
            manifest.documents[1].detected_via,
            Some(DetectionSource::Content)
        );
        assert_eq!(manifest.documents[2].grammar, None);
        assert_eq!(manifest.documents[0].sha256.len(), 64);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = build_manifest(dir.path()).expect_err("empty source dir fails");
        assert!(error.to_string().contains("no relay documents"));
    }
}
