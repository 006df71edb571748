use crate::codec::{DelimitedCodec, FixedWidthCodec, IdentifierCodec};
use crate::error::{RepositoryError, StoreError};
use crate::store::FileStore;
use crate::types::{CaseId, Stage, Subfolder};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub const PROCESSOS_DIR: &str = "Processos";
pub const OUTPUT_DIR: &str = "Output";
pub const REPORTS_DIR: &str = "Reports";
pub const LEDGER_FILE: &str = ".attempts.json";

/// Directory layout of a workspace
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    case_list: PathBuf,
}

impl Layout {
    /// `case_list` is resolved against `root` when relative
    pub fn new<P: AsRef<Path>>(root: P, case_list: &Path) -> Self {
        let root = root.as_ref().to_path_buf();
        let case_list = if case_list.is_absolute() {
            case_list.to_path_buf()
        } else {
            root.join(case_list)
        };
        Self { root, case_list }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn case_list(&self) -> &Path {
        &self.case_list
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    /// Directory holding the artifacts a stage consumes. Download has no
    /// input directory of its own; its outcome is recorded under `Processos/`.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        match stage {
            Stage::Download | Stage::Ocr => self.root.join(PROCESSOS_DIR),
            Stage::Report => self.root.join(OUTPUT_DIR),
            Stage::Fill => self.root.join(REPORTS_DIR),
        }
    }

    pub fn subfolder(&self, stage: Stage, sub: Subfolder) -> PathBuf {
        let dir = self.stage_dir(stage);
        match sub.dir_name() {
            Some(name) => dir.join(name),
            None => dir,
        }
    }
}

/// Counts of cases per state for one stage
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageCounts {
    pub fresh: usize,
    pub processed: usize,
    pub pending: usize,
}

/// Per-case stage status, read from the stage directories.
///
/// A case's state for a stage is wherever its artifact currently sits
/// (root, `Processed/` or `Pending/`). Every query re-lists the directory.
pub struct FileStateRepository {
    store: Arc<dyn FileStore>,
    layout: Layout,
    pdf: FixedWidthCodec,
    text: DelimitedCodec,
    report: DelimitedCodec,
    sidecar: DelimitedCodec,
    marker: DelimitedCodec,
}

impl FileStateRepository {
    pub fn new(store: Arc<dyn FileStore>, layout: Layout) -> Self {
        Self {
            store,
            layout,
            pdf: FixedWidthCodec::pdf(),
            text: DelimitedCodec::ocr_text(),
            report: DelimitedCodec::report(),
            sidecar: DelimitedCodec::error_sidecar(),
            marker: DelimitedCodec::download_marker(),
        }
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Naming convention of the artifact a stage consumes
    pub fn input_codec(&self, stage: Stage) -> Option<&dyn IdentifierCodec> {
        match stage {
            Stage::Download => None,
            Stage::Ocr => Some(&self.pdf),
            Stage::Report => Some(&self.text),
            Stage::Fill => Some(&self.report),
        }
    }

    /// Does a file for `id` sit in the given subfolder of the stage?
    pub fn exists_in_stage(
        &self,
        id: &CaseId,
        stage: Stage,
        sub: Subfolder,
    ) -> Result<bool, RepositoryError> {
        match (stage, sub) {
            (Stage::Download, Subfolder::Root) => Ok(self.read_case_list()?.contains(id)),
            (Stage::Download, Subfolder::Processed) => self.has_pdf_anywhere(id),
            (Stage::Download, Subfolder::Pending) => Ok(self
                .find_with(&self.layout.subfolder(stage, sub), &self.marker, id)?
                .is_some()),
            _ => Ok(self.locate(id, stage, sub)?.is_some()),
        }
    }

    /// Cases waiting in the stage root, not yet Processed nor Pending there
    pub fn list_pending(&self, stage: Stage) -> Result<BTreeSet<CaseId>, RepositoryError> {
        match self.input_codec(stage) {
            None => self.read_case_list(),
            Some(codec) => {
                let dir = self.layout.subfolder(stage, Subfolder::Root);
                self.ids_in(&dir, codec)?.ok_or(RepositoryError::DirectoryMissing {
                    stage,
                    path: dir,
                })
            }
        }
    }

    pub fn processed(&self, stage: Stage) -> Result<BTreeSet<CaseId>, RepositoryError> {
        match stage {
            Stage::Download => {
                let mut ids = BTreeSet::new();
                for sub in Subfolder::ALL {
                    let dir = self.layout.subfolder(Stage::Ocr, sub);
                    ids.extend(self.ids_in(&dir, &self.pdf)?.unwrap_or_default());
                }
                Ok(ids)
            }
            _ => self.terminal_ids(stage, Subfolder::Processed),
        }
    }

    pub fn pending(&self, stage: Stage) -> Result<BTreeSet<CaseId>, RepositoryError> {
        match stage {
            Stage::Download => {
                let dir = self.layout.subfolder(stage, Subfolder::Pending);
                Ok(self.ids_in(&dir, &self.marker)?.unwrap_or_default())
            }
            _ => self.terminal_ids(stage, Subfolder::Pending),
        }
    }

    /// Actual path of the case's artifact in a subfolder. Filenames are
    /// matched through the codec, so a hand-dropped file with a different
    /// prefix is still found.
    pub fn locate(
        &self,
        id: &CaseId,
        stage: Stage,
        sub: Subfolder,
    ) -> Result<Option<PathBuf>, RepositoryError> {
        let Some(codec) = self.input_codec(stage) else {
            return match sub {
                Subfolder::Root if self.read_case_list()?.contains(id) => {
                    Ok(Some(self.layout.case_list().to_path_buf()))
                }
                _ => Ok(None),
            };
        };

        let dir = self.layout.subfolder(stage, sub);
        match self.find_with(&dir, codec, id) {
            Err(RepositoryError::DirectoryMissing { .. }) if sub != Subfolder::Root => Ok(None),
            other => other,
        }
    }

    /// Where the stage writes its output for `id` (the next stage's root)
    pub fn output_path(&self, id: &CaseId, stage: Stage) -> Option<PathBuf> {
        let next = stage.next()?;
        let codec = self.input_codec(next)?;
        Some(
            self.layout
                .subfolder(next, Subfolder::Root)
                .join(codec.encode(id)),
        )
    }

    /// Has the stage's output for `id` already been produced, in any subfolder
    /// of the next stage?
    pub fn output_exists(&self, id: &CaseId, stage: Stage) -> Result<bool, RepositoryError> {
        let Some(next) = stage.next() else {
            return Ok(false);
        };
        for sub in Subfolder::ALL {
            match self.locate(id, next, sub) {
                Ok(Some(_)) => return Ok(true),
                Ok(None) | Err(RepositoryError::DirectoryMissing { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Error record for a case demoted to Pending
    pub fn pending_record_path(&self, id: &CaseId, stage: Stage) -> PathBuf {
        let dir = self.layout.subfolder(stage, Subfolder::Pending);
        match stage {
            Stage::Download => dir.join(self.marker.encode(id)),
            _ => dir.join(self.sidecar.encode(id)),
        }
    }

    /// Operator action: move a Pending case back to the stage root so the
    /// next run sees it as Fresh. Returns the requeued artifact's path.
    pub fn requeue(&self, id: &CaseId, stage: Stage) -> Result<PathBuf, RepositoryError> {
        let record = self.pending_record_path(id, stage);

        if stage == Stage::Download {
            if !self.store.exists(&record) {
                return Err(RepositoryError::NotPending {
                    stage,
                    id: id.to_string(),
                });
            }
            self.store.remove(&record).map_err(RepositoryError::Store)?;
            return Ok(self.layout.case_list().to_path_buf());
        }

        let pending = self
            .locate(id, stage, Subfolder::Pending)?
            .ok_or_else(|| RepositoryError::NotPending {
                stage,
                id: id.to_string(),
            })?;
        let file_name = pending.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        let target = self.layout.subfolder(stage, Subfolder::Root).join(file_name);

        self.store
            .rename(&pending, &target)
            .map_err(RepositoryError::Store)?;
        if self.store.exists(&record) {
            self.store.remove(&record).map_err(RepositoryError::Store)?;
        }
        Ok(target)
    }

    pub fn counts(&self, stage: Stage) -> Result<StageCounts, RepositoryError> {
        let processed = self.processed(stage)?;
        let pending = self.pending(stage)?;
        let waiting = match self.list_pending(stage) {
            Ok(ids) => ids,
            Err(e) if e.is_directory_missing() => BTreeSet::new(),
            Err(e) => return Err(e),
        };
        let fresh = waiting
            .iter()
            .filter(|id| !processed.contains(*id) && !pending.contains(*id))
            .count();

        Ok(StageCounts {
            fresh,
            processed: processed.len(),
            pending: pending.len(),
        })
    }

    /// Case ids listed in the download queue file, one per line.
    /// Blank lines and `#` comments are ignored; malformed ids are skipped.
    pub fn read_case_list(&self) -> Result<BTreeSet<CaseId>, RepositoryError> {
        let path = self.layout.case_list();
        let content = match self.store.read_to_string(path) {
            Ok(content) => content,
            Err(StoreError::NotFound(_)) => {
                return Err(RepositoryError::DirectoryMissing {
                    stage: Stage::Download,
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(RepositoryError::Store(e)),
        };

        let mut ids = BTreeSet::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match CaseId::parse(line) {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => warn!(error = %e, "Skipping case list entry"),
            }
        }
        Ok(ids)
    }

    fn has_pdf_anywhere(&self, id: &CaseId) -> Result<bool, RepositoryError> {
        for sub in Subfolder::ALL {
            let dir = self.layout.subfolder(Stage::Ocr, sub);
            match self.find_with(&dir, &self.pdf, id) {
                Ok(Some(_)) => return Ok(true),
                Ok(None) | Err(RepositoryError::DirectoryMissing { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    fn terminal_ids(
        &self,
        stage: Stage,
        sub: Subfolder,
    ) -> Result<BTreeSet<CaseId>, RepositoryError> {
        let Some(codec) = self.input_codec(stage) else {
            return Ok(BTreeSet::new());
        };
        let dir = self.layout.subfolder(stage, sub);
        Ok(self.ids_in(&dir, codec)?.unwrap_or_default())
    }

    /// Decoded ids in `dir`; `None` when the directory does not exist
    fn ids_in(
        &self,
        dir: &Path,
        codec: &dyn IdentifierCodec,
    ) -> Result<Option<BTreeSet<CaseId>>, RepositoryError> {
        match self.store.list(dir) {
            Ok(names) => Ok(Some(
                names.iter().filter_map(|name| codec.decode(name)).collect(),
            )),
            Err(StoreError::DirectoryMissing(_)) => Ok(None),
            Err(e) => Err(RepositoryError::Store(e)),
        }
    }

    fn find_with(
        &self,
        dir: &Path,
        codec: &dyn IdentifierCodec,
        id: &CaseId,
    ) -> Result<Option<PathBuf>, RepositoryError> {
        let names = match self.store.list(dir) {
            Ok(names) => names,
            Err(StoreError::DirectoryMissing(path)) => {
                return Err(RepositoryError::DirectoryMissing {
                    stage: self.stage_of(dir),
                    path,
                })
            }
            Err(e) => return Err(RepositoryError::Store(e)),
        };
        Ok(names
            .into_iter()
            .find(|name| codec.decode(name).as_ref() == Some(id))
            .map(|name| dir.join(name)))
    }

    fn stage_of(&self, dir: &Path) -> Stage {
        Stage::ALL
            .into_iter()
            .rev()
            .find(|stage| dir.starts_with(self.layout.stage_dir(*stage)))
            .unwrap_or(Stage::Download)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    const ID: &str = "50012345620254047102";
    const OTHER: &str = "50085259120254047102";

    fn id(raw: &str) -> CaseId {
        CaseId::parse(raw).unwrap()
    }

    fn repo() -> (Arc<MemoryStore>, FileStateRepository) {
        let store = Arc::new(MemoryStore::new());
        let layout = Layout::new("/work", Path::new("processos.txt"));
        let repo = FileStateRepository::new(store.clone(), layout);
        (store, repo)
    }

    #[test]
    fn test_missing_root_is_reported() {
        let (_, repo) = repo();
        let err = repo.list_pending(Stage::Ocr).unwrap_err();
        assert!(err.is_directory_missing());
        let err = repo.list_pending(Stage::Download).unwrap_err();
        assert!(err.is_directory_missing());
    }

    #[test]
    fn test_missing_terminal_folders_are_empty() {
        let (store, repo) = repo();
        store.create_dir_all(Path::new("/work/Output")).unwrap();
        assert!(repo.processed(Stage::Report).unwrap().is_empty());
        assert!(repo.pending(Stage::Report).unwrap().is_empty());
        assert!(!repo
            .exists_in_stage(&id(ID), Stage::Report, Subfolder::Processed)
            .unwrap());
    }

    #[test]
    fn test_list_pending_reads_root_only() {
        let (store, repo) = repo();
        store
            .write(Path::new("/work/Processos/PRC50012345620254047102.pdf"), b"%PDF")
            .unwrap();
        store
            .write(
                Path::new("/work/Processos/Processed/PRC50085259120254047102.pdf"),
                b"%PDF",
            )
            .unwrap();
        store
            .write(Path::new("/work/Processos/notes.txt"), b"ignored")
            .unwrap();

        let pending = repo.list_pending(Stage::Ocr).unwrap();
        assert_eq!(pending.into_iter().collect::<Vec<_>>(), vec![id(ID)]);
        assert!(repo.processed(Stage::Ocr).unwrap().contains(&id(OTHER)));
    }

    #[test]
    fn test_queries_see_external_changes() {
        let (store, repo) = repo();
        store.create_dir_all(Path::new("/work/Reports")).unwrap();
        assert!(repo.list_pending(Stage::Fill).unwrap().is_empty());

        store
            .write(
                Path::new("/work/Reports/50012345620254047102_final_report.md"),
                b"report",
            )
            .unwrap();
        assert_eq!(repo.list_pending(Stage::Fill).unwrap().len(), 1);
    }

    #[test]
    fn test_case_list_parsing() {
        let (store, repo) = repo();
        store
            .write(
                Path::new("/work/processos.txt"),
                b"# queue\n50012345620254047102\n\n5008525-91.2025.4.04.7102\nnot-a-case\n",
            )
            .unwrap();

        let ids = repo.read_case_list().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&id(ID)));
        assert!(ids.contains(&id(OTHER)));
    }

    #[test]
    fn test_download_status_comes_from_processos() {
        let (store, repo) = repo();
        store
            .write(Path::new("/work/processos.txt"), format!("{ID}\n{OTHER}\n").as_bytes())
            .unwrap();
        store
            .write(
                Path::new("/work/Processos/Pending/PRC50012345620254047102.pdf"),
                b"%PDF",
            )
            .unwrap();
        store
            .write(
                Path::new("/work/Processos/Pending/50085259120254047102_pending.txt"),
                b"failed",
            )
            .unwrap();

        // A PDF anywhere under Processos means the download happened
        assert!(repo
            .exists_in_stage(&id(ID), Stage::Download, Subfolder::Processed)
            .unwrap());
        assert!(repo
            .exists_in_stage(&id(OTHER), Stage::Download, Subfolder::Pending)
            .unwrap());
        assert_eq!(
            repo.counts(Stage::Download).unwrap(),
            StageCounts {
                fresh: 0,
                processed: 1,
                pending: 1
            }
        );
        // The marker is not an OCR artifact
        assert!(!repo.pending(Stage::Ocr).unwrap().contains(&id(OTHER)));
    }

    #[test]
    fn test_output_path_and_existence() {
        let (store, repo) = repo();
        let case = id(ID);
        assert_eq!(
            repo.output_path(&case, Stage::Ocr).unwrap(),
            PathBuf::from("/work/Output/50012345620254047102.txt")
        );
        assert_eq!(
            repo.output_path(&case, Stage::Report).unwrap(),
            PathBuf::from("/work/Reports/50012345620254047102_final_report.md")
        );
        assert_eq!(repo.output_path(&case, Stage::Fill), None);

        assert!(!repo.output_exists(&case, Stage::Ocr).unwrap());
        store
            .write(Path::new("/work/Output/Processed/50012345620254047102.txt"), b"t")
            .unwrap();
        assert!(repo.output_exists(&case, Stage::Ocr).unwrap());
    }

    #[test]
    fn test_requeue_moves_back_and_drops_sidecar() {
        let (store, repo) = repo();
        let case = id(ID);
        store
            .write(
                Path::new("/work/Reports/Pending/50012345620254047102_final_report.md"),
                b"report",
            )
            .unwrap();
        store
            .write(
                Path::new("/work/Reports/Pending/50012345620254047102_error.txt"),
                b"error",
            )
            .unwrap();

        let target = repo.requeue(&case, Stage::Fill).unwrap();

        assert_eq!(
            target,
            PathBuf::from("/work/Reports/50012345620254047102_final_report.md")
        );
        assert_eq!(store.snapshot(), vec![target]);
        assert!(repo.requeue(&case, Stage::Fill).is_err());
    }

    #[test]
    fn test_requeue_download_removes_marker() {
        let (store, repo) = repo();
        let marker = Path::new("/work/Processos/Pending/50012345620254047102_pending.txt");
        store.write(marker, b"failed").unwrap();

        repo.requeue(&id(ID), Stage::Download).unwrap();

        assert!(!store.exists(marker));
    }
}
