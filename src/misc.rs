use std::{
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use stacked_errors::{bail, Result, StackableErr};
use tokio::{fs, time::sleep};

/// Repeatedly calls `f` until it returns `Ok`, sleeping `delay` between
/// attempts. After `num_retries` failed retries the last error is returned
/// with context.
pub async fn wait_for_ok<F, Fut, T>(num_retries: u64, delay: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match f().await {
            Ok(o) => return Ok(o),
            Err(e) => {
                if retries >= num_retries {
                    return Err(e).stack_err_with(|| {
                        format!(
                            "wait_for_ok(num_retries: {num_retries}, delay: {delay:?}) ran out \
                             of retries"
                        )
                    })
                }
            }
        }
        retries += 1;
        sleep(delay).await;
    }
}

/// Canonicalizes and checks the existence of a file path, with better error
/// information. Used on discovered binary paths before trusting them.
///
/// Note: this does not prevent TOCTOU bugs.
pub async fn acquire_file_path(file_path: impl AsRef<Path>) -> Result<PathBuf> {
    let file_path = file_path.as_ref();
    let mut path = fs::canonicalize(file_path)
        .await
        .stack_err_with(|| format!("acquire_file_path(file_path: {file_path:?})"))?;
    if cfg!(windows) {
        path = dunce::simplified(&path).to_owned();
    }
    if path.is_file() {
        Ok(path)
    } else {
        bail!("acquire_file_path(file_path: {file_path:?}) -> is not a file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_ok_retries_until_success() {
        let mut attempts = 0;
        let out = wait_for_ok(5, Duration::from_millis(1), || {
            attempts += 1;
            let ok = attempts >= 3;
            async move {
                if ok {
                    Ok(42)
                } else {
                    bail!("not yet")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn wait_for_ok_gives_up() {
        let res: Result<()> =
            wait_for_ok(2, Duration::from_millis(1), || async { bail!("always") }).await;
        assert!(res.is_err());
    }
}
