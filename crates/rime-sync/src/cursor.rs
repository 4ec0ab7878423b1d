use std::io;
use std::path::PathBuf;

use rime_types::Seq;

/// The persisted changes-feed position: a single-line text file, written
/// atomically and only after the corresponding batch has landed in the
/// store. A crash between batches replays the last batch, which is safe
/// because updates are idempotent and deleting an absent entry is a no-op.
#[derive(Debug)]
pub struct SeqCursor {
    path: PathBuf,
}

impl SeqCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the committed position; a missing or empty file means the feed
    /// origin.
    pub async fn load(&self) -> io::Result<Seq> {
        match fs_err::tokio::read_to_string(&self.path).await {
            Ok(contents) => {
                let seq = contents.trim();
                if seq.is_empty() {
                    Ok(Seq::initial())
                } else {
                    Ok(Seq::new(seq))
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Seq::initial()),
            Err(err) => Err(err),
        }
    }

    /// Commit a new position via temp file + rename.
    pub async fn store(&self, seq: &Seq) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension(format!("{:016x}.tmp", fastrand::u64(..)));
        fs_err::tokio::write(&temp, format!("{seq}\n")).await?;
        fs_err::tokio::rename(&temp, &self.path).await
    }
}

#[cfg(test)]
mod tests {
    use rime_types::Seq;

    use super::SeqCursor;

    #[tokio::test]
    async fn missing_file_is_the_origin() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = SeqCursor::new(dir.path().join("data/.sync-seq"));
        assert_eq!(cursor.load().await.unwrap(), Seq::initial());
    }

    #[tokio::test]
    async fn round_trips_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/.sync-seq");

        let cursor = SeqCursor::new(&path);
        cursor.store(&Seq::new("42")).await.unwrap();
        assert_eq!(cursor.load().await.unwrap(), Seq::new("42"));

        // A fresh instance (a restart) sees the committed value.
        let cursor = SeqCursor::new(&path);
        assert_eq!(cursor.load().await.unwrap(), Seq::new("42"));
        assert_eq!(
            fs_err::read_to_string(&path).unwrap().trim(),
            "42"
        );
    }
}
