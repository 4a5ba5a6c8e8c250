//! Reference build backend.
//!
//! `ContextBackend` does not execute instructions. It spools and digests
//! the uploaded context, reads the Dockerfile out of the archive and
//! reports each instruction as a build step. The image id is derived from
//! the context digest plus the options that select what gets built.
//!
//! Spooled contexts are kept as cache records until pruned. They live in
//! a temporary directory that is removed when the backend is dropped.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use kiln_core::message::JsonProgress;
use kiln_core::{
    Backend, BoxFuture, BuildConfig, BuildError, BuildOptions, BuildResult, BuildSource,
    CachePruneOptions, CachePruneReport, JsonMessage, ProgressWriter, RequestContext,
};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Context progress is reported each time another this-many bytes arrive.
const REPORT_INTERVAL: u64 = 1024 * 1024;

const CONTEXT_PROGRESS_ID: &str = "context";

struct CacheRecord {
    path: PathBuf,
    size: u64,
    last_used: u64,
}

/// A context written to the spool directory.
struct Spooled {
    path: PathBuf,
    digest: String,
    size: u64,
}

/// What the archive contains, as far as the backend cares.
struct ArchiveSummary {
    entries: usize,
    dockerfile: Option<String>,
}

pub struct ContextBackend {
    spool: TempDir,
    /// Running builds that registered a `buildid`.
    builds: Mutex<HashMap<String, CancellationToken>>,
    /// Cache records keyed by context digest.
    cache: Mutex<HashMap<String, CacheRecord>>,
    /// Monotonic counter for spool file names and LRU order.
    clock: AtomicU64,
}

impl ContextBackend {
    /// Create a backend spooling into a fresh directory under
    /// `spool_parent`, or under the system temp dir when `None`.
    pub fn new(spool_parent: Option<&Path>) -> io::Result<Self> {
        let spool = match spool_parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                tempfile::Builder::new()
                    .prefix("kiln-spool-")
                    .tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix("kiln-spool-").tempdir()?,
        };
        info!(path = ?spool.path(), "spool directory created");
        Ok(Self {
            spool,
            builds: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        })
    }

    pub fn spool_dir(&self) -> &Path {
        self.spool.path()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn register(
        &self,
        ctx: &RequestContext,
        build_id: Option<&str>,
    ) -> BuildResult<Registration<'_>> {
        let token = ctx.token().child_token();
        if let Some(id) = build_id {
            let mut builds = lock(&self.builds);
            if builds.contains_key(id) {
                return Err(BuildError::InvalidArgument(format!(
                    "build id {id:?} is already in use"
                )));
            }
            builds.insert(id.to_string(), token.clone());
        }
        Ok(Registration {
            builds: &self.builds,
            id: build_id.map(str::to_string),
            token,
        })
    }

    async fn run(
        &self,
        token: &CancellationToken,
        source: BuildSource,
        progress: &mut ProgressWriter<'_>,
        options: &BuildOptions,
    ) -> BuildResult<String> {
        let spooled = self.spool_context(token, source, progress).await?;

        let reused = !options.no_cache && self.touch(&spooled.digest);
        if reused {
            progress
                .stream(format!("Using cached context {}\n", short_id(&spooled.digest)))
                .await
                .map_err(BuildError::Progress)?;
        }

        let outcome = self.describe(token, &spooled, progress, options).await;

        let adopted = outcome.is_ok() && !options.no_cache && !reused && self.adopt(&spooled);
        if !adopted {
            remove_spool(&spooled.path).await;
        }
        outcome
    }

    async fn spool_context(
        &self,
        token: &CancellationToken,
        mut source: BuildSource,
        progress: &mut ProgressWriter<'_>,
    ) -> BuildResult<Spooled> {
        let path = self
            .spool
            .path()
            .join(format!("context-{}.tar", self.tick()));
        let mut file = tokio::fs::File::create(&path).await?;

        match receive(token, &mut source, &mut file, progress).await {
            Ok((digest, size)) => {
                debug!(%digest, size, "context received");
                Ok(Spooled { path, digest, size })
            }
            Err(e) => {
                drop(file);
                remove_spool(&path).await;
                Err(e)
            }
        }
    }

    async fn describe(
        &self,
        token: &CancellationToken,
        spooled: &Spooled,
        progress: &mut ProgressWriter<'_>,
        options: &BuildOptions,
    ) -> BuildResult<String> {
        let path = spooled.path.clone();
        let wanted = options.dockerfile.clone();
        let summary = tokio::task::spawn_blocking(move || inspect_archive(&path, &wanted))
            .await
            .map_err(|e| BuildError::Failed(format!("archive inspection failed: {e}")))?
            .map_err(|e| BuildError::InvalidContext(e.to_string()))?;
        if token.is_cancelled() {
            return Err(BuildError::Canceled);
        }
        debug!(entries = summary.entries, "context archive listed");

        let text = summary.dockerfile.ok_or_else(|| {
            BuildError::InvalidContext(format!(
                "Cannot locate specified Dockerfile: {}",
                options.dockerfile
            ))
        })?;
        let steps = instructions(&text);
        if steps.is_empty() {
            return Err(BuildError::InvalidContext(
                "the Dockerfile contains no instructions".to_string(),
            ));
        }
        if let Some(target) = &options.target {
            if !declares_stage(&steps, target) {
                return Err(BuildError::InvalidArgument(format!(
                    "target stage {target:?} could not be found"
                )));
            }
        }

        progress
            .stream(format!(
                "Sending build context to builder {} ({} entries)\n",
                human_size(spooled.size),
                summary.entries
            ))
            .await
            .map_err(BuildError::Progress)?;

        let total = steps.len();
        for (i, step) in steps.iter().enumerate() {
            if token.is_cancelled() {
                return Err(BuildError::Canceled);
            }
            progress
                .stream(format!("Step {}/{} : {}\n", i + 1, total, step))
                .await
                .map_err(BuildError::Progress)?;
        }

        let id = image_id(&spooled.digest, options);
        progress
            .stream(format!("Successfully built {}\n", short_id(&id)))
            .await
            .map_err(BuildError::Progress)?;
        for tag in &options.tags {
            progress
                .stream(format!("Successfully tagged {tag}\n"))
                .await
                .map_err(BuildError::Progress)?;
        }
        Ok(id)
    }

    /// Mark an existing record as used. Returns whether one existed.
    fn touch(&self, digest: &str) -> bool {
        let now = self.tick();
        match lock(&self.cache).get_mut(digest) {
            Some(record) => {
                record.last_used = now;
                true
            }
            None => false,
        }
    }

    /// Keep a spooled context as a cache record. Returns false when a
    /// record for the same digest already exists.
    fn adopt(&self, spooled: &Spooled) -> bool {
        let now = self.tick();
        let mut cache = lock(&self.cache);
        if cache.contains_key(&spooled.digest) {
            return false;
        }
        cache.insert(
            spooled.digest.clone(),
            CacheRecord {
                path: spooled.path.clone(),
                size: spooled.size,
                last_used: now,
            },
        );
        true
    }

    /// Remove the records selected by `options`, oldest first.
    fn evict(&self, options: &CachePruneOptions, ids: Option<&[String]>) -> Vec<(String, CacheRecord)> {
        let mut cache = lock(&self.cache);
        let mut candidates: Vec<(u64, String)> = cache
            .iter()
            .filter(|(id, _)| ids.is_none_or(|ids| ids.iter().any(|want| matches_id(id, want))))
            .map(|(id, record)| (record.last_used, id.clone()))
            .collect();
        candidates.sort();

        let unbounded = options.all || options.keep_storage == 0;
        let mut total: u64 = cache.values().map(|r| r.size).sum();
        let mut removed = Vec::new();
        for (_, id) in candidates {
            if !unbounded && total <= options.keep_storage {
                break;
            }
            if let Some(record) = cache.remove(&id) {
                total -= record.size;
                removed.push((id, record));
            }
        }
        removed
    }
}

impl Backend for ContextBackend {
    fn build<'a>(
        &'a self,
        ctx: RequestContext,
        config: BuildConfig<'a>,
    ) -> BoxFuture<'a, BuildResult<String>> {
        Box::pin(async move {
            let BuildConfig {
                source,
                mut progress,
                options,
            } = config;
            let source = source.ok_or(BuildError::MissingContext)?;
            let registration = self.register(&ctx, options.build_id.as_deref())?;
            self.run(&registration.token, source, &mut progress, &options)
                .await
        })
    }

    fn cancel<'a>(&'a self, _ctx: RequestContext, id: &'a str) -> BoxFuture<'a, BuildResult<()>> {
        Box::pin(async move {
            match lock(&self.builds).get(id) {
                Some(token) => {
                    info!(build_id = %id, "cancelling build");
                    token.cancel();
                }
                None => debug!(build_id = %id, "no running build with this id"),
            }
            Ok(())
        })
    }

    fn prune_cache(
        &self,
        _ctx: RequestContext,
        options: CachePruneOptions,
    ) -> BoxFuture<'_, BuildResult<CachePruneReport>> {
        Box::pin(async move {
            let ids = id_filter(&options.filters)?;
            let removed = self.evict(&options, ids.as_deref());

            let mut report = CachePruneReport::default();
            for (id, record) in removed {
                remove_spool(&record.path).await;
                report.space_reclaimed += record.size;
                report.caches_deleted.push(id);
            }
            info!(
                deleted = report.caches_deleted.len(),
                reclaimed = report.space_reclaimed,
                "build cache pruned"
            );
            Ok(report)
        })
    }
}

/// Keeps a build id registered for the lifetime of one build.
struct Registration<'a> {
    builds: &'a Mutex<HashMap<String, CancellationToken>>,
    id: Option<String>,
    token: CancellationToken,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            lock(self.builds).remove(&id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Copy the source into `file`, hashing as it goes.
async fn receive(
    token: &CancellationToken,
    source: &mut BuildSource,
    file: &mut tokio::fs::File,
    progress: &mut ProgressWriter<'_>,
) -> BuildResult<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut next_report = REPORT_INTERVAL;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BuildError::Canceled),
            chunk = source.next_chunk() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;

        let received = source.bytes_read();
        if received >= next_report {
            report_context(progress, received).await?;
            next_report = (received / REPORT_INTERVAL + 1) * REPORT_INTERVAL;
        }
    }
    file.flush().await?;

    let size = source.bytes_read();
    report_context(progress, size).await?;
    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size))
}

async fn report_context(progress: &mut ProgressWriter<'_>, received: u64) -> BuildResult<()> {
    let mut message = JsonMessage::status(
        Some(CONTEXT_PROGRESS_ID.to_string()),
        "Receiving build context",
    );
    message.progress_detail = Some(JsonProgress {
        current: received,
        total: None,
    });
    message.progress = Some(human_size(received));
    progress
        .write_message(&message)
        .await
        .map_err(BuildError::Progress)
}

async fn remove_spool(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "failed to remove spooled context");
        }
    }
}

/// Count the entries of a tar archive and read the Dockerfile at `wanted`.
fn inspect_archive(path: &Path, wanted: &str) -> io::Result<ArchiveSummary> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(file);
    let wanted = normalize_path(wanted);

    let mut summary = ArchiveSummary {
        entries: 0,
        dockerfile: None,
    };
    for entry in archive.entries()? {
        let mut entry = entry?;
        summary.entries += 1;
        if summary.dockerfile.is_none()
            && normalize_path(&entry.path()?.to_string_lossy()) == wanted
        {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            summary.dockerfile = Some(text);
        }
    }
    Ok(summary)
}

fn normalize_path(path: &str) -> &str {
    path.trim_start_matches("./").trim_start_matches('/')
}

/// Split a Dockerfile into instructions, joining `\` continuations and
/// dropping comments and blank lines.
fn instructions(dockerfile: &str) -> Vec<String> {
    let mut steps = Vec::new();
    let mut pending = String::new();
    for line in dockerfile.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.strip_suffix('\\') {
            Some(head) => push_part(&mut pending, head.trim_end()),
            None => {
                push_part(&mut pending, line);
                steps.push(std::mem::take(&mut pending));
            }
        }
    }
    if !pending.is_empty() {
        steps.push(pending);
    }
    steps
}

fn push_part(buf: &mut String, part: &str) {
    if part.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(part);
}

/// Whether a `FROM … AS <target>` stage exists.
fn declares_stage(steps: &[String], target: &str) -> bool {
    steps.iter().any(|step| {
        let tokens: Vec<&str> = step.split_whitespace().collect();
        tokens
            .first()
            .is_some_and(|first| first.eq_ignore_ascii_case("from"))
            && tokens
                .windows(2)
                .any(|w| w[0].eq_ignore_ascii_case("as") && w[1] == target)
    })
}

fn image_id(context_digest: &str, options: &BuildOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context_digest.as_bytes());
    for tag in &options.tags {
        hasher.update(b"\0tag=");
        hasher.update(tag.as_bytes());
    }
    if let Some(target) = &options.target {
        hasher.update(b"\0target=");
        hasher.update(target.as_bytes());
    }
    for (key, value) in &options.build_args {
        hasher.update(b"\0arg=");
        hasher.update(key.as_bytes());
        if let Some(value) = value {
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn short_id(id: &str) -> &str {
    let hex = id.strip_prefix("sha256:").unwrap_or(id);
    &hex[..hex.len().min(12)]
}

fn matches_id(id: &str, want: &str) -> bool {
    let want = want.strip_prefix("sha256:").unwrap_or(want);
    !want.is_empty() && id.strip_prefix("sha256:").unwrap_or(id).starts_with(want)
}

fn id_filter(filters: &HashMap<String, Vec<String>>) -> BuildResult<Option<Vec<String>>> {
    if let Some(key) = filters.keys().find(|key| key.as_str() != "id") {
        return Err(BuildError::InvalidArgument(format!("invalid filter {key:?}")));
    }
    Ok(filters.get("id").cloned())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}
