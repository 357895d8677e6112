use crate::error::{PersistTempFile, Result, TempFileCreation, WriteToTempFile};
use snafu::ResultExt;
use std::{fs, io::Write, path::Path};
use tempfile::NamedTempFile as TempFile;

/// Replace the contents of the file at 'path' with 'buf'. The buffer is written to a temporary
/// file in the same directory which is then renamed onto 'path', so readers observe either the
/// old or the new contents. Concurrent writers race, and the last rename wins.
pub(crate) fn write_atomically<P>(path: P, buf: &[u8]) -> Result<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).context(TempFileCreation {
        path: dir.to_path_buf(),
    })?;

    let mut handle: TempFile = TempFile::new_in(dir).context(TempFileCreation {
        path: dir.to_path_buf(),
    })?;

    handle.write_all(buf).context(WriteToTempFile {
        path: handle.path().to_path_buf(),
    })?;

    handle.persist(path).context(PersistTempFile {
        path: path.to_path_buf(),
    })?;

    Ok(())
}
