use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{InsertOutcome, Store};
use crate::ingest::FeedItem;
use crate::model::{
    Article, ArticleId, CandidateId, CandidateItem, Citation, Digest, DigestId, NewSource,
    NewTheme, Source, SourceId, Theme, ThemeId, Validators,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    next_id: i64,
    sources: BTreeMap<SourceId, Source>,
    candidates: BTreeMap<CandidateId, CandidateItem>,
    articles: BTreeMap<ArticleId, Article>,
    themes: BTreeMap<ThemeId, Theme>,
    digests: BTreeMap<DigestId, Digest>,
    citations: BTreeMap<DigestId, Vec<Citation>>,
}

impl Tables {
    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store guarded by a single `RwLock`; no lock is held across an await.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.inner.read().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.inner.write().map_err(|_| anyhow!("store lock poisoned"))
    }

    /// Write all tables to `path` as JSON (tmp file + rename).
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let json = {
            let t = self.read()?;
            serde_json::to_vec_pretty(&*t).context("serializing store snapshot")?
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating snapshot dir {}", dir.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(&json)?;
        fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }

    /// Load a snapshot written by `save_snapshot`. A missing file yields an empty store.
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let tables: Tables = serde_json::from_str(&data)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;
        Ok(Self {
            inner: RwLock::new(tables),
        })
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn add_source(&self, source: NewSource) -> Result<SourceId> {
        let mut t = self.write()?;
        if t.sources.values().any(|s| s.url == source.url) {
            bail!("source url already registered: {}", source.url);
        }
        let id = t.next();
        t.sources.insert(
            id,
            Source {
                id,
                name: source.name,
                url: source.url,
                kind: source.kind,
                active: source.active,
                validators: Validators::default(),
                error_count: 0,
                last_error: None,
                last_fetched_at: None,
            },
        );
        Ok(id)
    }

    async fn get_source(&self, id: SourceId) -> Result<Option<Source>> {
        Ok(self.read()?.sources.get(&id).cloned())
    }

    async fn list_sources(&self, active_only: bool) -> Result<Vec<Source>> {
        Ok(self
            .read()?
            .sources
            .values()
            .filter(|s| !active_only || s.active)
            .cloned()
            .collect())
    }

    async fn record_fetch_success(
        &self,
        id: SourceId,
        validators: Option<Validators>,
    ) -> Result<()> {
        let mut t = self.write()?;
        let s = t
            .sources
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown source {id}"))?;
        if let Some(v) = validators {
            s.validators = v;
        }
        s.error_count = 0;
        s.last_error = None;
        s.last_fetched_at = Some(Utc::now());
        Ok(())
    }

    async fn record_fetch_failure(&self, id: SourceId, error: &str) -> Result<()> {
        let mut t = self.write()?;
        let s = t
            .sources
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown source {id}"))?;
        s.error_count = s.error_count.saturating_add(1);
        s.last_error = Some(error.to_string());
        Ok(())
    }

    async fn insert_candidate(&self, source_id: SourceId, item: &FeedItem) -> Result<InsertOutcome> {
        let mut t = self.write()?;
        if t
            .candidates
            .values()
            .any(|c| c.source_id == source_id && c.link == item.link)
        {
            return Ok(InsertOutcome::Duplicate);
        }
        let id = t.next();
        t.candidates.insert(
            id,
            CandidateItem {
                id,
                source_id,
                link: item.link.clone(),
                title: item.title.clone(),
                description: item.description.clone(),
                published_at: item.published_at,
                discovered_at: Utc::now(),
                processed: false,
            },
        );
        Ok(InsertOutcome::Inserted(id))
    }

    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<CandidateItem>> {
        let t = self.read()?;
        let it = t.candidates.values().filter(|c| !c.processed).cloned();
        Ok(if limit == 0 {
            it.collect()
        } else {
            it.take(limit).collect()
        })
    }

    async fn mark_processed(&self, id: CandidateId) -> Result<bool> {
        let mut t = self.write()?;
        match t.candidates.get_mut(&id) {
            Some(c) if !c.processed => {
                c.processed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_article(&self, mut article: Article) -> Result<ArticleId> {
        let mut t = self.write()?;
        let id = t.next();
        article.id = id;
        t.articles.insert(id, article);
        Ok(id)
    }

    async fn get_article(&self, id: ArticleId) -> Result<Option<Article>> {
        Ok(self.read()?.articles.get(&id).cloned())
    }

    async fn update_article(&self, article: &Article) -> Result<()> {
        let mut t = self.write()?;
        let slot = t
            .articles
            .get_mut(&article.id)
            .ok_or_else(|| anyhow!("unknown article {}", article.id))?;
        *slot = article.clone();
        Ok(())
    }

    async fn list_articles_since(&self, since: DateTime<Utc>) -> Result<Vec<Article>> {
        Ok(self
            .read()?
            .articles
            .values()
            .filter(|a| a.published_at.unwrap_or(a.fetched_at) >= since)
            .cloned()
            .collect())
    }

    async fn add_theme(&self, theme: NewTheme) -> Result<ThemeId> {
        let mut t = self.write()?;
        if t
            .themes
            .values()
            .any(|x| x.name.eq_ignore_ascii_case(&theme.name))
        {
            bail!("theme name already exists: {}", theme.name);
        }
        let id = t.next();
        t.themes.insert(
            id,
            Theme {
                id,
                name: theme.name,
                description: theme.description,
                keywords: theme.keywords,
                enabled: theme.enabled,
            },
        );
        Ok(id)
    }

    async fn list_themes(&self, enabled_only: bool) -> Result<Vec<Theme>> {
        Ok(self
            .read()?
            .themes
            .values()
            .filter(|x| !enabled_only || x.enabled)
            .cloned()
            .collect())
    }

    async fn insert_digest(&self, mut digest: Digest) -> Result<DigestId> {
        let mut t = self.write()?;
        let id = t.next();
        digest.id = id;
        t.digests.insert(id, digest);
        Ok(id)
    }

    async fn get_digest(&self, id: DigestId) -> Result<Option<Digest>> {
        Ok(self.read()?.digests.get(&id).cloned())
    }

    async fn list_digests(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Digest>> {
        Ok(self
            .read()?
            .digests
            .values()
            .filter(|d| d.processed_date >= from && d.processed_date <= to)
            .cloned()
            .collect())
    }

    async fn insert_citations(&self, digest_id: DigestId, citations: &[Citation]) -> Result<()> {
        let mut t = self.write()?;
        if !t.digests.contains_key(&digest_id) {
            bail!("unknown digest {digest_id}");
        }
        t.citations
            .entry(digest_id)
            .or_default()
            .extend_from_slice(citations);
        Ok(())
    }

    async fn list_citations(&self, digest_id: DigestId) -> Result<Vec<Citation>> {
        Ok(self
            .read()?
            .citations
            .get(&digest_id)
            .cloned()
            .unwrap_or_default())
    }
}
