use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use rand::seq::SliceRandom;

use crate::offsets::{OffsetRange, TopicPartition};
use crate::storage::StorageDriver;
use crate::{RestructureError, Result};

/// Directory name the sink uses for staging; never scanned.
const TMP_DIR_MARKER: &str = "+tmp";

/// Extension of record container files.
const RECORD_EXTENSION: &str = "avro";

/// One source container file with its parsed offset range.
#[derive(Debug, Clone)]
pub struct TopicFile {
    /// Topic the file belongs to, taken from the file name.
    pub topic: String,
    /// Full source path.
    pub path: PathBuf,
    /// Partition the file covers.
    pub partition: TopicPartition,
    /// Offset range parsed from the file name.
    pub range: OffsetRange,
}

impl TopicFile {
    /// Parses `topic+partition+offsetFrom+offsetTo.<ext>` into a file
    /// descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RestructureError::InvalidFileName`] when the name does
    /// not have exactly four `+`-separated segments with numeric
    /// partition and offsets, or when `offsetFrom > offsetTo`.
    pub fn parse(path: &Path) -> Result<Self> {
        let invalid = || RestructureError::InvalidFileName(path.display().to_string());
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(invalid)?;

        let segments: Vec<&str> = stem.split('+').collect();
        let [topic, partition, from, to] = segments.as_slice() else {
            return Err(invalid());
        };
        if topic.is_empty() {
            return Err(invalid());
        }
        let partition: u32 = partition.parse().map_err(|_| invalid())?;
        let from: u64 = from.parse().map_err(|_| invalid())?;
        let to: u64 = to.parse().map_err(|_| invalid())?;
        let range = OffsetRange::new(from, to).map_err(|_| invalid())?;

        Ok(Self {
            topic: topic.to_string(),
            path: path.to_path_buf(),
            partition: TopicPartition::new(topic.to_string(), partition),
            range,
        })
    }

    /// Number of offsets this file covers.
    pub fn size(&self) -> u64 {
        self.range.size()
    }
}

/// Ordered list of source files for one topic.
#[derive(Debug, Default)]
pub struct TopicFileList {
    files: Vec<TopicFile>,
    size: u64,
}

impl TopicFileList {
    /// Builds a list, accumulating the total offset count.
    pub fn new(files: Vec<TopicFile>) -> Self {
        let size = files.iter().map(TopicFile::size).sum();
        Self { files, size }
    }

    /// Total number of offsets across all files.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when no files are listed.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Reorders largest-first so long files start earliest and the
    /// tail of a run stays short.
    pub fn sort_largest_first(&mut self) {
        self.files
            .sort_by(|a, b| b.size().cmp(&a.size()).then(a.path.cmp(&b.path)));
    }

    /// Iterates the files in list order.
    pub fn iter(&self) -> impl Iterator<Item = &TopicFile> {
        self.files.iter()
    }
}

/// Lazy discovery of topic directories and record files on a storage
/// driver.
pub struct SourceScanner {
    driver: Arc<dyn StorageDriver>,
}

impl SourceScanner {
    /// Creates a scanner over the source driver.
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self { driver }
    }

    /// Walks `root` for topic directories: any directory directly
    /// containing a `*.avro` file marks its grandparent as a topic
    /// directory. `+tmp` staging directories are pruned. Results are
    /// de-duplicated and shuffled so repeated runs spread lock
    /// contention across workers.
    pub fn find_topic_paths(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut found = HashSet::new();
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            for entry in self.driver.list(&dir)? {
                if entry.is_directory {
                    if entry.path.file_name().is_some_and(|n| n == TMP_DIR_MARKER) {
                        continue;
                    }
                    stack.push(entry.path);
                } else if is_record_file(&entry.path) {
                    if let Some(topic_dir) = entry.path.parent().and_then(Path::parent) {
                        found.insert(topic_dir.to_path_buf());
                    }
                }
            }
        }

        let mut topics: Vec<PathBuf> = found.into_iter().collect();
        topics.sort_unstable();
        topics.shuffle(&mut rand::thread_rng());
        Ok(topics)
    }

    /// Enumerates the record files under a topic directory that are not
    /// yet covered by `already_done`, capped at `max_files` *after*
    /// filtering, in enumeration order. Unparseable names are skipped
    /// with a warning.
    pub fn list_topic_files<F>(
        &self,
        topic_dir: &Path,
        already_done: F,
        max_files: Option<usize>,
    ) -> Result<TopicFileList>
    where
        F: Fn(&TopicFile) -> bool,
    {
        let mut files = Vec::new();
        let mut stack = vec![topic_dir.to_path_buf()];

        'walk: while let Some(dir) = stack.pop() {
            for entry in self.driver.list(&dir)? {
                if entry.is_directory {
                    if entry.path.file_name().is_some_and(|n| n == TMP_DIR_MARKER) {
                        continue;
                    }
                    stack.push(entry.path);
                    continue;
                }
                if !is_record_file(&entry.path) {
                    continue;
                }
                let file = match TopicFile::parse(&entry.path) {
                    Ok(file) => file,
                    Err(e) => {
                        warn!("skipping source file: {e}");
                        continue;
                    }
                };
                if already_done(&file) {
                    continue;
                }
                files.push(file);
                if max_files.is_some_and(|max| files.len() >= max) {
                    break 'walk;
                }
            }
        }

        Ok(TopicFileList::new(files))
    }
}

fn is_record_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == RECORD_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorageDriver;
    use std::fs;

    fn scanner() -> SourceScanner {
        SourceScanner::new(Arc::new(LocalStorageDriver::new()))
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn parse_valid_file_name() {
        let file = TopicFile::parse(Path::new("/data/a+0+0+1.avro")).unwrap();
        assert_eq!(file.topic, "a");
        assert_eq!(file.partition, TopicPartition::new("a", 0));
        assert_eq!((file.range.from, file.range.to), (0, 1));
        assert_eq!(file.size(), 2);
    }

    #[test]
    fn parse_rejects_malformed_names() {
        for name in [
            "a+0+1.avro",
            "a+0+1+2+3.avro",
            "+0+1+2.avro",
            "a+x+1+2.avro",
            "a+0+5+4.avro",
            "nodividers.avro",
        ] {
            assert!(TopicFile::parse(Path::new(name)).is_err(), "{name}");
        }
    }

    #[test]
    fn finds_grandparents_of_record_files_pruning_tmp() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("t1/2017-05-02/t1+0+0+1.avro"));
        touch(&root.path().join("t1/2017-05-03/t1+0+2+3.avro"));
        touch(&root.path().join("t2/2017-05-02/t2+0+0+0.avro"));
        touch(&root.path().join("+tmp/2017-05-02/hidden+0+0+0.avro"));
        touch(&root.path().join("t3/+tmp/hidden+0+0+0.avro"));
        touch(&root.path().join("t4/2017-05-02/notes.txt"));

        let mut topics = scanner().find_topic_paths(root.path()).unwrap();
        topics.sort_unstable();
        assert_eq!(
            topics,
            vec![root.path().join("t1"), root.path().join("t2")]
        );
    }

    #[test]
    fn lists_unseen_files_and_caps_after_filter() {
        let root = tempfile::tempdir().unwrap();
        let topic = root.path().join("t");
        touch(&topic.join("d/t+0+0+9.avro"));
        touch(&topic.join("d/t+0+10+19.avro"));
        touch(&topic.join("d/t+0+20+24.avro"));
        touch(&topic.join("d/garbage.avro"));

        // Everything below offset 10 is already done; cap at one file.
        let list = scanner()
            .list_topic_files(&topic, |f| f.range.to < 10, Some(1))
            .unwrap();
        assert_eq!(list.len(), 1);
        let file = list.iter().next().unwrap();
        assert!(file.range.from >= 10);
    }

    #[test]
    fn list_sorts_largest_first() {
        let root = tempfile::tempdir().unwrap();
        let topic = root.path().join("t");
        touch(&topic.join("d/t+0+0+1.avro"));
        touch(&topic.join("d/t+0+2+90.avro"));
        touch(&topic.join("d/t+1+0+10.avro"));

        let mut list = scanner().list_topic_files(&topic, |_| false, None).unwrap();
        list.sort_largest_first();
        let sizes: Vec<u64> = list.iter().map(TopicFile::size).collect();
        assert_eq!(sizes, vec![89, 11, 2]);
        assert_eq!(list.size(), 102);
    }
}
