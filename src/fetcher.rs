use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::api::{DatasetSource, FetchError};
use crate::record::SiteRecord;

/// Records from one page, handed to the caller as soon as the page lands.
#[derive(Debug)]
pub struct PageBatch {
    pub page: u32,
    pub records: Vec<SiteRecord>,
}

/// Fetch stats returned after completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub total_pages: u32,
    pub fetched_pages: u32,
    pub records: usize,
    pub failed_pages: u32,
}

/// Fetch every page of `year`, delivering each one to `on_page` as it arrives.
///
/// Page 1 is always delivered first. Pages 2.. are fetched concurrently,
/// at most `concurrency` at a time, and delivered in completion order.
/// A failed trailing page does not stop the others; the first failure is
/// returned once everything has settled.
pub async fn fetch_all_streaming<F>(
    source: Arc<dyn DatasetSource>,
    year: &str,
    concurrency: usize,
    mut on_page: F,
) -> Result<FetchStats, FetchError>
where
    F: FnMut(PageBatch),
{
    let first = source.fetch_page(year, 1).await?;
    let total_pages = first.total_page.max(1);
    let mut stats = FetchStats {
        total_pages,
        fetched_pages: 1,
        records: first.records.len(),
        failed_pages: 0,
    };
    info!(
        "Year {}: page 1/{} ({} rows)",
        year,
        total_pages,
        first.records.len()
    );
    on_page(PageBatch {
        page: 1,
        records: first.records,
    });

    if total_pages <= 1 {
        return Ok(stats);
    }

    // Never more permits than trailing pages; keeps huge values under the semaphore cap
    let limit = concurrency.clamp(1, (total_pages - 1) as usize);
    let semaphore = Arc::new(Semaphore::new(limit));
    let pb = ProgressBar::new(u64::from(total_pages - 1));
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} pages")
    {
        pb.set_style(style.progress_chars("=> "));
    }

    // Channel: page tasks send results, this loop hands them to the caller
    let (tx, mut rx) =
        tokio::sync::mpsc::channel::<(u32, Result<Vec<SiteRecord>, FetchError>)>(limit * 2);

    for page in 2..=total_pages {
        let source = Arc::clone(&source);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();
        let year = year.to_string();

        tokio::spawn(async move {
            // The semaphore is never closed, so acquire only fails if it is dropped.
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            let result = source.fetch_page(&year, page).await.map(|p| p.records);
            let _ = tx.send((page, result)).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let mut first_error = None;
    while let Some((page, result)) = rx.recv().await {
        match result {
            Ok(records) => {
                stats.fetched_pages += 1;
                stats.records += records.len();
                on_page(PageBatch { page, records });
            }
            Err(e) => {
                warn!("Page {} of {} failed: {}", page, year, e);
                stats.failed_pages += 1;
                first_error.get_or_insert(e);
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(
        "Year {}: fetched {}/{} pages, {} rows ({} failed)",
        year, stats.fetched_pages, total_pages, stats.records, stats.failed_pages
    );

    match first_error {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}

/// Fetch every page of `year` into one record set.
pub async fn fetch_all(
    source: Arc<dyn DatasetSource>,
    year: &str,
    concurrency: usize,
) -> Result<Vec<SiteRecord>, FetchError> {
    let mut all = Vec::new();
    fetch_all_streaming(source, year, concurrency, |batch| all.extend(batch.records)).await?;
    Ok(all)
}
