// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Drive organizer: fans out image analysis and files results into folders
//!
//! A run lists the images in a source folder and processes them in batches.
//! Each batch downloads concurrently into a private temp directory, drops
//! content duplicates, analyzes the rest in one bounded concurrent batch and
//! uploads every recognized image under `<destination>/<category>/...`.

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::config::OrganizationConfig;
use crate::history::{create_entry, History};
use crate::recognition::{ImageRecognizer, Recognition};
use crate::storage::{RemoteFile, StorageProvider, FOLDER_ID_PREFIX};
use crate::tagstore::{ImageRecord, TagStore};
use crate::{OrganizerError, Result};

/// Extensions treated as images
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp", "heic", "heif",
];

/// Progress callback receiving `(done, total)`
pub type ProgressFn<'a> = dyn Fn(usize, usize) + Send + Sync + 'a;

/// Folder layout and batching for a run
#[derive(Debug, Clone)]
pub struct OrganizeOptions {
    pub include_year: bool,
    pub include_month: bool,
    pub use_original_filenames: bool,
    pub batch_size: usize,
    pub temp_dir: PathBuf,
    pub skip_duplicates: bool,
    /// Plan placements without uploading anything
    pub dry_run: bool,
}

impl OrganizeOptions {
    pub fn from_config(config: &OrganizationConfig) -> Self {
        Self {
            include_year: config.include_year,
            include_month: config.include_month,
            use_original_filenames: config.use_original_filenames,
            batch_size: config.batch_size.max(1),
            temp_dir: PathBuf::from(&config.temp_dir),
            skip_duplicates: config.skip_duplicates,
            dry_run: false,
        }
    }
}

impl Default for OrganizeOptions {
    fn default() -> Self {
        Self::from_config(&OrganizationConfig::default())
    }
}

/// Where an image goes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub folder: String,
    pub file_name: String,
}

impl Placement {
    pub fn path(&self) -> String {
        if self.folder.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.folder, self.file_name)
        }
    }
}

/// Counts for a batch or a whole run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

impl std::ops::AddAssign for BatchOutcome {
    fn add_assign(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// An image that could not be organized
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedFile {
    pub file_id: String,
    pub name: String,
    pub reason: String,
}

/// An organized image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedFile {
    pub file_id: String,
    pub name: String,
    pub placement: Placement,
    /// ID of the uploaded copy; `None` in dry runs
    pub uploaded_id: Option<String>,
    pub recognition: Recognition,
}

/// Analysis of one image without organizing it
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedFile {
    pub file: RemoteFile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition: Option<Recognition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Compute the folder and file name for an analyzed image
pub fn plan_destination(
    file: &RemoteFile,
    recognition: &Recognition,
    destination_root: &str,
    options: &OrganizeOptions,
) -> Placement {
    let date: DateTime<Utc> = file.created_time.unwrap_or_else(Utc::now);

    let mut parts: Vec<String> = Vec::new();
    let root = destination_root.trim().trim_matches('/');
    if !root.is_empty() {
        parts.push(root.to_string());
    }
    parts.push(recognition.category.clone());
    if options.include_year {
        parts.push(date.format("%Y").to_string());
        if options.include_month {
            parts.push(date.format("%B").to_string());
        }
    }

    let file_name = if options.use_original_filenames {
        file.name.clone()
    } else {
        let label_part: Vec<String> = recognition
            .labels
            .iter()
            .take(2)
            .map(|l| l.trim().to_lowercase().replace([' ', '/', '\\'], "_"))
            .filter(|l| !l.is_empty())
            .collect();
        let base = if label_part.is_empty() {
            "image".to_string()
        } else {
            label_part.join("_")
        };
        format!("{}_{}{}", base, date.format("%Y%m%d"), file.extension())
    };

    Placement {
        folder: parts.join("/"),
        file_name,
    }
}

/// Calculate blake3 content hash for deduplication
pub fn calculate_file_hash(path: &Path) -> Result<String> {
    let data = std::fs::read(path)?;
    Ok(blake3::hash(&data).to_hex().to_string())
}

/// Coordinates storage, recognition, tag store and journal for a run
pub struct DriveOrganizer {
    storage: Arc<dyn StorageProvider>,
    recognizer: Arc<dyn ImageRecognizer>,
    tag_store: Option<TagStore>,
    history: Option<History>,
    options: OrganizeOptions,
    user_id: Option<String>,
    seen_hashes: HashSet<String>,
    pub failed_files: Vec<FailedFile>,
    pub processed_files: Vec<ProcessedFile>,
}

/// A downloaded image awaiting analysis
struct Staged {
    file: RemoteFile,
    path: PathBuf,
    content_hash: String,
}

impl DriveOrganizer {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        recognizer: Arc<dyn ImageRecognizer>,
        options: OrganizeOptions,
    ) -> Self {
        Self {
            storage,
            recognizer,
            tag_store: None,
            history: None,
            options,
            user_id: None,
            seen_hashes: HashSet::new(),
            failed_files: Vec::new(),
            processed_files: Vec::new(),
        }
    }

    pub fn with_tag_store(mut self, tag_store: TagStore) -> Self {
        self.tag_store = Some(tag_store);
        self
    }

    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    /// Owner recorded on tag store entries
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn options(&self) -> &OrganizeOptions {
        &self.options
    }

    pub async fn authenticate(&self) -> Result<bool> {
        self.storage.authenticate().await
    }

    /// Images directly inside `source`
    pub async fn get_image_files(&self, source: &str) -> Result<Vec<RemoteFile>> {
        let files = self.storage.list_files(source, IMAGE_EXTENSIONS).await?;
        info!("Found {} images in '{}'", files.len(), source);
        Ok(files)
    }

    pub fn plan_destination(&self, file: &RemoteFile, recognition: &Recognition, destination_root: &str) -> Placement {
        plan_destination(file, recognition, destination_root, &self.options)
    }

    /// Upload one analyzed image to its planned place and record it
    pub async fn organize_file(
        &self,
        file: &RemoteFile,
        local_path: &Path,
        recognition: &Recognition,
        destination: &str,
        content_hash: Option<&str>,
    ) -> Result<ProcessedFile> {
        let placement = self.plan_destination(file, recognition, destination);

        if self.options.dry_run {
            info!("[dry run] {} -> {}", file.name, placement.path());
            return Ok(ProcessedFile {
                file_id: file.id.clone(),
                name: file.name.clone(),
                placement,
                uploaded_id: None,
                recognition: recognition.clone(),
            });
        }

        let folder = self
            .storage
            .get_folder(&placement.folder, true)
            .await?
            .ok_or_else(|| OrganizerError::NotFound(format!("Folder {}", placement.folder)))?;
        let uploaded = self
            .storage
            .upload_file(
                local_path,
                &format!("{}{}", FOLDER_ID_PREFIX, folder.id),
                Some(&placement.file_name),
            )
            .await?;
        info!("{} -> {}", file.name, placement.path());

        if let Some(history) = &self.history {
            history.append(&create_entry(
                &file.id,
                &file.name,
                &uploaded.id,
                &placement.folder,
                &uploaded.name,
                &recognition.category,
                recognition.labels.clone(),
                content_hash.map(str::to_string),
            ))?;
        }

        if let Some(store) = &self.tag_store {
            store.store_image_metadata(&ImageRecord {
                id: file.id.clone(),
                name: file.name.clone(),
                user_id: self.user_id.clone(),
                category: recognition.category.clone(),
                tags: recognition.labels.clone(),
                content_hash: content_hash.map(str::to_string),
                source_id: Some(file.id.clone()),
                destination: Some(format!("{}/{}", placement.folder, uploaded.name)),
                metadata: serde_json::json!({
                    "mime_type": file.mime_type,
                    "size": file.size,
                    "uploaded_id": uploaded.id,
                    "created_time": file.created_time,
                }),
                created_at: Utc::now(),
            })?;
        }

        Ok(ProcessedFile {
            file_id: file.id.clone(),
            name: file.name.clone(),
            placement,
            uploaded_id: Some(uploaded.id),
            recognition: recognition.clone(),
        })
    }

    fn record_failure(&mut self, file: &RemoteFile, reason: impl ToString) {
        let reason = reason.to_string();
        error!("Failed to process {}: {}", file.name, reason);
        self.failed_files.push(FailedFile {
            file_id: file.id.clone(),
            name: file.name.clone(),
            reason,
        });
    }

    /// New per-run scratch directory, removed when dropped
    async fn scratch_dir(&self) -> Result<TempDir> {
        tokio::fs::create_dir_all(&self.options.temp_dir).await?;
        Ok(tempfile::Builder::new().prefix("run-").tempdir_in(&self.options.temp_dir)?)
    }

    /// Download files concurrently into `dir`, keeping input order
    async fn download_all(&self, files: &[RemoteFile], dir: &Path) -> Vec<Result<PathBuf>> {
        let storage = &self.storage;
        let pending: Vec<_> = files
            .iter()
            .enumerate()
            .map(|(i, file)| {
                let target = dir.join(format!("{:05}{}", i, file.extension()));
                async move { storage.download_file(&file.id, &target).await }
            })
            .collect();
        stream::iter(pending)
            .buffered(self.recognizer.concurrency().max(1))
            .collect()
            .await
    }

    /// Download, dedupe, analyze and organize one batch
    pub async fn process_batch(
        &mut self,
        files: &[RemoteFile],
        destination: &str,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<BatchOutcome> {
        let dir = self.scratch_dir().await?;
        let outcome = self.process_batch_in(files, destination, progress, dir.path()).await;

        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            warn!("Could not remove temp dir {:?}: {}", path, e);
        }
        outcome
    }

    async fn process_batch_in(
        &mut self,
        files: &[RemoteFile],
        destination: &str,
        progress: Option<&ProgressFn<'_>>,
        dir: &Path,
    ) -> Result<BatchOutcome> {
        let total = files.len();
        let mut outcome = BatchOutcome::default();
        let report = |outcome: &BatchOutcome| {
            if let Some(progress) = progress {
                progress(outcome.total(), total);
            }
        };

        let downloads = self.download_all(files, dir).await;

        let mut staged = Vec::new();
        for (file, download) in files.iter().zip(downloads) {
            let path = match download {
                Ok(path) => path,
                Err(e) => {
                    self.record_failure(file, e);
                    outcome.failed += 1;
                    report(&outcome);
                    continue;
                }
            };

            let content_hash = match calculate_file_hash(&path) {
                Ok(hash) => hash,
                Err(e) => {
                    self.record_failure(file, e);
                    outcome.failed += 1;
                    report(&outcome);
                    continue;
                }
            };

            if self.options.skip_duplicates && self.is_duplicate(&content_hash)? {
                debug!("Skipping duplicate {} ({})", file.name, content_hash);
                outcome.skipped += 1;
                report(&outcome);
                continue;
            }

            staged.push(Staged {
                file: file.clone(),
                path,
                content_hash,
            });
        }

        // Copies sharing a hash wait until an earlier copy has been organized;
        // if that copy fails, the next one is attempted.
        while !staged.is_empty() {
            let (round, waiting) = self.split_round(staged);

            let paths: Vec<PathBuf> = round.iter().map(|s| s.path.clone()).collect();
            let results = self.recognizer.analyze_batch(&paths).await;

            for (item, result) in round.iter().zip(results) {
                let organized = match result {
                    Ok(recognition) => {
                        self.organize_file(&item.file, &item.path, &recognition, destination, Some(&item.content_hash))
                            .await
                    }
                    Err(e) => Err(e),
                };

                match organized {
                    Ok(processed) => {
                        self.seen_hashes.insert(item.content_hash.clone());
                        self.processed_files.push(processed);
                        outcome.succeeded += 1;
                    }
                    Err(e) => {
                        self.record_failure(&item.file, e);
                        outcome.failed += 1;
                    }
                }
                report(&outcome);
            }

            staged = Vec::new();
            for item in waiting {
                if self.seen_hashes.contains(&item.content_hash) {
                    debug!("Skipping duplicate {} ({})", item.file.name, item.content_hash);
                    outcome.skipped += 1;
                    report(&outcome);
                } else {
                    staged.push(item);
                }
            }
        }

        Ok(outcome)
    }

    /// First copy of each content hash, and the copies held back behind it
    fn split_round(&self, staged: Vec<Staged>) -> (Vec<Staged>, Vec<Staged>) {
        if !self.options.skip_duplicates {
            return (staged, Vec::new());
        }
        let mut leading = HashSet::new();
        staged
            .into_iter()
            .partition(|item| leading.insert(item.content_hash.clone()))
    }

    fn is_duplicate(&self, content_hash: &str) -> Result<bool> {
        if self.seen_hashes.contains(content_hash) {
            return Ok(true);
        }
        match &self.tag_store {
            Some(store) => Ok(store.find_by_hash(content_hash)?.is_some()),
            None => Ok(false),
        }
    }

    /// Organize every image in `source` under `destination`
    pub async fn organize_folder(
        &mut self,
        source: &str,
        destination: &str,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<BatchOutcome> {
        if !self.authenticate().await? {
            return Err(OrganizerError::Authentication(format!(
                "Failed to authenticate with {}",
                self.storage.name()
            )));
        }

        let files = self.get_image_files(source).await?;
        if files.is_empty() {
            warn!("No images found in '{}'", source);
            return Ok(BatchOutcome::default());
        }

        let total = files.len();
        let batch_size = self.options.batch_size.max(1);
        let mut outcome = BatchOutcome::default();
        self.seen_hashes.clear();

        for (index, batch) in files.chunks(batch_size).enumerate() {
            info!(
                "Processing batch {}/{} ({} images)",
                index + 1,
                total.div_ceil(batch_size),
                batch.len()
            );

            let done_before = outcome.total();
            let batch_progress = move |done: usize, _: usize| {
                if let Some(progress) = progress {
                    progress(done_before + done, total);
                }
            };
            outcome += self.process_batch(batch, destination, Some(&batch_progress)).await?;
        }

        info!(
            "Organized {} of {} images ({} failed, {} skipped)",
            outcome.succeeded, total, outcome.failed, outcome.skipped
        );
        Ok(outcome)
    }

    /// Download and analyze up to `limit` images without organizing them
    pub async fn analyze_folder(&self, source: &str, limit: Option<usize>) -> Result<Vec<AnalyzedFile>> {
        let mut files = self.get_image_files(source).await?;
        if let Some(limit) = limit {
            files.truncate(limit);
        }
        if files.is_empty() {
            warn!("No images found in '{}'", source);
            return Ok(Vec::new());
        }

        let dir = self.scratch_dir().await?;
        let downloads = self.download_all(&files, dir.path()).await;

        let mut analyzed = Vec::with_capacity(files.len());
        let mut pending = Vec::new();
        for (file, download) in files.into_iter().zip(downloads) {
            match download {
                Ok(path) => {
                    pending.push((analyzed.len(), path));
                    analyzed.push(AnalyzedFile { file, recognition: None, error: None });
                }
                Err(e) => analyzed.push(AnalyzedFile { file, recognition: None, error: Some(e.to_string()) }),
            }
        }

        let paths: Vec<PathBuf> = pending.iter().map(|(_, p)| p.clone()).collect();
        let results = self.recognizer.analyze_batch(&paths).await;
        for ((index, _), result) in pending.iter().zip(results) {
            match result {
                Ok(recognition) => analyzed[*index].recognition = Some(recognition),
                Err(e) => analyzed[*index].error = Some(e.to_string()),
            }
        }

        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            warn!("Could not remove temp dir {:?}: {}", path, e);
        }
        Ok(analyzed)
    }

    /// Release provider resources
    pub async fn close(&self) -> Result<()> {
        self.recognizer.close().await?;
        self.storage.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalProvider;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Labels an image with its text content; "broken" fails
    struct ContentRecognizer;

    #[async_trait]
    impl ImageRecognizer for ContentRecognizer {
        fn name(&self) -> &'static str {
            "content"
        }

        async fn analyze_image(&self, path: &Path) -> Result<Recognition> {
            let text = std::fs::read_to_string(path)?;
            let label = text.trim().to_string();
            if label == "broken" {
                return Err(OrganizerError::Recognition("cannot decode".into()));
            }
            let category = match label.as_str() {
                "dog" => "Animals",
                "beach" => "Landscapes",
                _ => "Other",
            };
            Ok(Recognition { category: category.into(), labels: vec![label] })
        }

        fn supported_categories(&self) -> Vec<String> {
            vec!["Animals".into(), "Landscapes".into(), "Other".into()]
        }
    }

    fn remote(name: &str, created: Option<DateTime<Utc>>) -> RemoteFile {
        RemoteFile {
            id: format!("id-{}", name),
            name: name.to_string(),
            mime_type: "image/jpeg".to_string(),
            created_time: created,
            modified_time: None,
            parents: vec![],
            size: None,
        }
    }

    fn recognition(category: &str, labels: &[&str]) -> Recognition {
        Recognition {
            category: category.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn test_plan_destination_with_year_and_month() {
        let options = OrganizeOptions { include_month: true, ..OrganizeOptions::default() };
        let file = remote("IMG_001.JPG", Some(Utc.with_ymd_and_hms(2023, 7, 14, 10, 0, 0).unwrap()));
        let placement = plan_destination(&file, &recognition("Landscapes", &["Sandy Beach", "sea", "sky"]), "Sorted/", &options);

        assert_eq!(placement.folder, "Sorted/Landscapes/2023/July");
        assert_eq!(placement.file_name, "sandy_beach_sea_20230714.jpg");
        assert_eq!(placement.path(), "Sorted/Landscapes/2023/July/sandy_beach_sea_20230714.jpg");
    }

    #[test]
    fn test_plan_destination_month_requires_year() {
        let options = OrganizeOptions {
            include_year: false,
            include_month: true,
            use_original_filenames: true,
            ..OrganizeOptions::default()
        };
        let file = remote("IMG_001.JPG", Some(Utc.with_ymd_and_hms(2023, 7, 14, 10, 0, 0).unwrap()));
        let placement = plan_destination(&file, &recognition("Other", &[]), "", &options);

        assert_eq!(placement.folder, "Other");
        assert_eq!(placement.file_name, "IMG_001.JPG");
    }

    #[test]
    fn test_plan_destination_without_labels_or_date() {
        let options = OrganizeOptions::default();
        let file = remote("scan.png", None);
        let placement = plan_destination(&file, &recognition("Other", &[]), "Out", &options);

        let today = Utc::now();
        assert_eq!(placement.folder, format!("Out/Other/{}", today.format("%Y")));
        assert_eq!(placement.file_name, format!("image_{}.png", today.format("%Y%m%d")));
    }

    fn seed_drive(root: &Path) {
        let inbox = root.join("Inbox");
        std::fs::create_dir_all(&inbox).unwrap();
        std::fs::write(inbox.join("a.jpg"), "dog").unwrap();
        std::fs::write(inbox.join("b.png"), "beach").unwrap();
        std::fs::write(inbox.join("c.jpg"), "dog").unwrap();
        std::fs::write(inbox.join("d.jpg"), "broken").unwrap();
        std::fs::write(inbox.join("notes.txt"), "dog").unwrap();
    }

    fn organizer(root: &Path, scratch: &Path) -> DriveOrganizer {
        let options = OrganizeOptions {
            include_year: false,
            use_original_filenames: true,
            batch_size: 2,
            temp_dir: scratch.to_path_buf(),
            ..OrganizeOptions::default()
        };
        DriveOrganizer::new(Arc::new(LocalProvider::new(root)), Arc::new(ContentRecognizer), options)
    }

    #[tokio::test]
    async fn test_organize_folder_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("drive");
        let scratch = dir.path().join("scratch");
        seed_drive(&root);

        let store = TagStore::in_memory().unwrap();
        let history_path = dir.path().join("history.jsonl");
        let mut organizer = organizer(&root, &scratch)
            .with_tag_store(store.clone())
            .with_history(History::new(&history_path))
            .with_user("tester");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = move |done: usize, total: usize| sink.lock().unwrap().push((done, total));

        let outcome = organizer.organize_folder("Inbox", "Sorted", Some(&progress)).await.unwrap();

        assert_eq!(outcome, BatchOutcome { succeeded: 2, failed: 1, skipped: 1 });
        assert!(root.join("Sorted/Animals/a.jpg").exists());
        assert!(root.join("Sorted/Landscapes/b.png").exists());
        assert!(!root.join("Sorted/Animals/c.jpg").exists());
        assert!(root.join("Inbox/a.jpg").exists());

        assert_eq!(organizer.failed_files.len(), 1);
        assert_eq!(organizer.failed_files[0].name, "d.jpg");
        assert_eq!(organizer.processed_files.len(), 2);

        let progress = seen.lock().unwrap();
        assert_eq!(progress.last(), Some(&(4, 4)));
        assert!(progress.iter().all(|(_, total)| *total == 4));

        assert_eq!(store.images_in_category("Animals").unwrap(), vec!["Inbox/a.jpg".to_string()]);
        let record = store.get_image_metadata("Inbox/a.jpg").unwrap().unwrap();
        assert_eq!(record.user_id.as_deref(), Some("tester"));
        assert_eq!(record.destination.as_deref(), Some("Sorted/Animals/a.jpg"));

        let journal = History::new(&history_path).read_all().unwrap();
        assert_eq!(journal.len(), 2);

        // Scratch space is cleaned after every batch
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_second_run_skips_known_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("drive");
        seed_drive(&root);
        let store = TagStore::in_memory().unwrap();

        let mut first = organizer(&root, &dir.path().join("s")).with_tag_store(store.clone());
        first.organize_folder("Inbox", "Sorted", None).await.unwrap();

        let mut second = organizer(&root, &dir.path().join("s")).with_tag_store(store);
        let outcome = second.organize_folder("Inbox", "Sorted", None).await.unwrap();
        assert_eq!(outcome, BatchOutcome { succeeded: 0, failed: 1, skipped: 3 });
    }

    /// Fails its first call, then labels like [`ContentRecognizer`]
    struct FailsOnce {
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ImageRecognizer for FailsOnce {
        fn name(&self) -> &'static str {
            "fails-once"
        }

        async fn analyze_image(&self, path: &Path) -> Result<Recognition> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(OrganizerError::Recognition("timed out".into()));
            }
            ContentRecognizer.analyze_image(path).await
        }

        fn supported_categories(&self) -> Vec<String> {
            ContentRecognizer.supported_categories()
        }
    }

    #[tokio::test]
    async fn test_identical_copy_is_tried_after_first_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("drive");
        std::fs::create_dir_all(root.join("Inbox")).unwrap();
        std::fs::write(root.join("Inbox/a.jpg"), "dog").unwrap();
        std::fs::write(root.join("Inbox/c.jpg"), "dog").unwrap();

        let options = OrganizeOptions {
            include_year: false,
            use_original_filenames: true,
            temp_dir: dir.path().join("s"),
            ..OrganizeOptions::default()
        };
        let recognizer = FailsOnce { failed: Default::default() };
        let mut organizer = DriveOrganizer::new(Arc::new(LocalProvider::new(&root)), Arc::new(recognizer), options);

        let outcome = organizer.organize_folder("Inbox", "Sorted", None).await.unwrap();
        assert_eq!(outcome, BatchOutcome { succeeded: 1, failed: 1, skipped: 0 });
        assert_eq!(std::fs::read_dir(root.join("Sorted/Animals")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_undone_images_are_organized_again() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("drive");
        std::fs::create_dir_all(root.join("Inbox")).unwrap();
        std::fs::write(root.join("Inbox/a.jpg"), "dog").unwrap();
        std::fs::write(root.join("Inbox/b.png"), "beach").unwrap();

        let store = TagStore::in_memory().unwrap();
        let history_path = dir.path().join("history.jsonl");
        let scratch = dir.path().join("s");

        let mut first = organizer(&root, &scratch)
            .with_tag_store(store.clone())
            .with_history(History::new(&history_path));
        let outcome = first.organize_folder("Inbox", "Sorted", None).await.unwrap();
        assert_eq!(outcome.succeeded, 2);

        let report = History::new(&history_path)
            .undo(&LocalProvider::new(&root), Some(&store), 0, false)
            .await
            .unwrap();
        assert_eq!(report.undone, 2);
        assert!(!root.join("Sorted/Animals/a.jpg").exists());
        assert!(store.get_image_metadata("Inbox/a.jpg").unwrap().is_none());

        let mut second = organizer(&root, &scratch)
            .with_tag_store(store.clone())
            .with_history(History::new(&history_path));
        let outcome = second.organize_folder("Inbox", "Sorted", None).await.unwrap();
        assert_eq!(outcome, BatchOutcome { succeeded: 2, failed: 0, skipped: 0 });
        assert!(root.join("Sorted/Animals/a.jpg").exists());
    }

    /// Signals once analysis starts, then never finishes
    struct Stalled {
        reached: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ImageRecognizer for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn analyze_image(&self, _path: &Path) -> Result<Recognition> {
            self.reached.notify_one();
            std::future::pending().await
        }

        fn supported_categories(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_removes_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("drive");
        let scratch = dir.path().join("scratch");
        seed_drive(&root);

        let reached = Arc::new(tokio::sync::Notify::new());
        let options = OrganizeOptions { temp_dir: scratch.clone(), ..OrganizeOptions::default() };
        let recognizer = Stalled { reached: reached.clone() };
        let mut organizer = DriveOrganizer::new(Arc::new(LocalProvider::new(&root)), Arc::new(recognizer), options);

        tokio::select! {
            _ = organizer.organize_folder("Inbox", "Sorted", None) => panic!("analysis should not finish"),
            _ = reached.notified() => {}
        }

        assert!(scratch.is_dir());
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_uploads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("drive");
        seed_drive(&root);

        let mut organizer = organizer(&root, &dir.path().join("s"));
        organizer.options.dry_run = true;
        let outcome = organizer.organize_folder("Inbox", "Sorted", None).await.unwrap();

        assert_eq!(outcome.succeeded, 2);
        assert!(!root.join("Sorted").exists());
        assert!(organizer.processed_files.iter().all(|p| p.uploaded_id.is_none()));
    }

    #[tokio::test]
    async fn test_empty_folder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("drive");
        std::fs::create_dir_all(root.join("Empty")).unwrap();

        let mut organizer = organizer(&root, &dir.path().join("s"));
        let outcome = organizer.organize_folder("Empty", "Sorted", None).await.unwrap();
        assert_eq!(outcome, BatchOutcome::default());
    }

    struct Unauthorized;

    #[async_trait]
    impl StorageProvider for Unauthorized {
        fn name(&self) -> &'static str {
            "unauthorized"
        }
        async fn authenticate(&self) -> Result<bool> {
            Ok(false)
        }
        async fn list_files(&self, _: &str, _: &[&str]) -> Result<Vec<RemoteFile>> {
            unreachable!()
        }
        async fn download_file(&self, _: &str, _: &Path) -> Result<PathBuf> {
            unreachable!()
        }
        async fn upload_file(&self, _: &Path, _: &str, _: Option<&str>) -> Result<RemoteFile> {
            unreachable!()
        }
        async fn create_folder(&self, _: &str, _: Option<&str>) -> Result<RemoteFile> {
            unreachable!()
        }
        async fn get_folder(&self, _: &str, _: bool) -> Result<Option<RemoteFile>> {
            unreachable!()
        }
        async fn download_stream(&self, _: &str) -> Result<crate::storage::ByteStream> {
            unreachable!()
        }
        async fn delete_file(&self, _: &str) -> Result<()> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        let mut organizer = DriveOrganizer::new(Arc::new(Unauthorized), Arc::new(ContentRecognizer), OrganizeOptions::default());
        assert!(matches!(
            organizer.organize_folder("Inbox", "Sorted", None).await,
            Err(OrganizerError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_analyze_folder_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("drive");
        seed_drive(&root);

        let organizer = organizer(&root, &dir.path().join("s"));
        let analyzed = organizer.analyze_folder("Inbox", Some(3)).await.unwrap();

        assert_eq!(analyzed.len(), 3);
        assert_eq!(analyzed[0].file.name, "a.jpg");
        assert_eq!(analyzed[0].recognition.as_ref().unwrap().category, "Animals");
        assert_eq!(analyzed[1].recognition.as_ref().unwrap().category, "Landscapes");
        assert!(!root.join("Sorted").exists());
    }
}
