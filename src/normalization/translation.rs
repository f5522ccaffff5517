use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::title::{normalize, strip_annotations};

pub const TITLE_MAPPINGS_FILE: &str = "title_mappings.json";
pub const FLAGGED_TITLES_FILE: &str = "flagged_titles.json";

/// Default minimum length (in characters) for substring mapping matches.
pub const DEFAULT_SUBSTRING_MIN_CHARS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleTranslation {
    pub translated: String,
    pub flagged: bool,
}

/// Source-title -> translated-title dictionaries. Editorially flagged titles
/// live in their own dictionary and take precedence at every stage.
#[derive(Debug, Clone, Default)]
pub struct TitleMappings {
    pub flagged: BTreeMap<String, String>,
    pub general: BTreeMap<String, String>,
}

fn lookup_in(dict: &BTreeMap<String, String>, title: &str, stage: Stage, min_chars: usize) -> Option<String> {
    match stage {
        Stage::Exact => dict.get(title).cloned(),
        Stage::CaseInsensitive => {
            let lower = title.to_lowercase();
            dict.iter()
                .find(|(k, _)| k.to_lowercase() == lower)
                .map(|(_, v)| v.clone())
        }
        Stage::BracketStripped => {
            let stripped = strip_annotations(title);
            if stripped == title {
                return None;
            }
            dict.get(&stripped).cloned()
        }
        Stage::Normalized => {
            let n = normalize(title);
            dict.iter().find(|(k, _)| normalize(k) == n).map(|(_, v)| v.clone())
        }
        Stage::Substring => {
            let n = normalize(title);
            if n.chars().count() < min_chars {
                return None;
            }
            // longest contained key is the most specific
            dict.iter()
                .map(|(k, v)| (normalize(k), v))
                .filter(|(k, _)| k.chars().count() >= min_chars && n.contains(k.as_str()))
                .max_by_key(|(k, _)| k.chars().count())
                .map(|(_, v)| v.clone())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Exact,
    CaseInsensitive,
    BracketStripped,
    Normalized,
    Substring,
}

const CASCADE: [Stage; 5] = [
    Stage::Exact,
    Stage::CaseInsensitive,
    Stage::BracketStripped,
    Stage::Normalized,
    Stage::Substring,
];

impl TitleMappings {
    /// Translated title via the cascade: exact, case-insensitive,
    /// bracket-stripped, normalized, then substring containment.
    pub fn lookup(&self, title: &str, min_chars: usize) -> Option<TitleTranslation> {
        if title.trim().is_empty() {
            return None;
        }
        let flagged = self.is_flagged(title, min_chars);
        for stage in CASCADE {
            for dict in [&self.flagged, &self.general] {
                if let Some(translated) = lookup_in(dict, title, stage, min_chars) {
                    return Some(TitleTranslation { translated, flagged });
                }
            }
        }
        None
    }

    pub fn is_flagged(&self, title: &str, min_chars: usize) -> bool {
        !title.trim().is_empty()
            && CASCADE
                .iter()
                .any(|stage| lookup_in(&self.flagged, title, *stage, min_chars).is_some())
    }

    pub fn len(&self) -> usize {
        self.flagged.len() + self.general.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A missing file is an empty dictionary; any other read or parse failure is an error.
fn read_dict(path: &Path) -> Result<BTreeMap<String, String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Lazily loaded view of the mapping files. Readers share an immutable
/// snapshot; `record` writes through to disk and invalidates it.
#[derive(Debug)]
pub struct TitleMappingCache {
    dir: Option<PathBuf>,
    min_chars: usize,
    loaded: RwLock<Option<Arc<TitleMappings>>>,
}

impl TitleMappingCache {
    pub fn new(dir: impl Into<PathBuf>, min_chars: usize) -> Self {
        Self {
            dir: Some(dir.into()),
            min_chars,
            loaded: RwLock::new(None),
        }
    }

    /// Fixed in-memory dictionaries, never backed by files.
    pub fn preloaded(mappings: TitleMappings, min_chars: usize) -> Self {
        Self {
            dir: None,
            min_chars,
            loaded: RwLock::new(Some(Arc::new(mappings))),
        }
    }

    pub fn min_chars(&self) -> usize {
        self.min_chars
    }

    pub fn snapshot(&self) -> Arc<TitleMappings> {
        if let Some(m) = self.loaded.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return m.clone();
        }
        let mut slot = self.loaded.write().unwrap_or_else(|e| e.into_inner());
        if let Some(m) = slot.as_ref() {
            return m.clone();
        }
        let Some(dir) = &self.dir else {
            return Arc::new(TitleMappings::default());
        };
        let loaded = read_dict(&dir.join(FLAGGED_TITLES_FILE))
            .and_then(|flagged| Ok((flagged, read_dict(&dir.join(TITLE_MAPPINGS_FILE))?)));
        let mappings = match loaded {
            Ok((flagged, general)) => TitleMappings { flagged, general },
            Err(e) => {
                // not cached, the next lookup retries the files
                warn!(error = %format!("{e:#}"), "title mappings unreadable; resolving without them");
                return Arc::new(TitleMappings::default());
            }
        };
        info!(
            flagged = mappings.flagged.len(),
            general = mappings.general.len(),
            "title mappings loaded"
        );
        let arc = Arc::new(mappings);
        *slot = Some(arc.clone());
        arc
    }

    pub fn lookup(&self, title: &str) -> Option<TitleTranslation> {
        self.snapshot().lookup(title, self.min_chars)
    }

    pub fn is_flagged(&self, title: &str) -> bool {
        self.snapshot().is_flagged(title, self.min_chars)
    }

    pub fn invalidate(&self) {
        if self.dir.is_some() {
            *self.loaded.write().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }

    /// Adds `source -> translated` to the general (or flagged) dictionary file.
    pub fn record(&self, source: &str, translated: &str, flagged: bool) -> Result<()> {
        let Some(dir) = &self.dir else {
            anyhow::bail!("title mappings are not file-backed");
        };
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let file = dir.join(if flagged { FLAGGED_TITLES_FILE } else { TITLE_MAPPINGS_FILE });
        let mut dict = read_dict(&file)?;
        dict.insert(source.trim().to_string(), translated.trim().to_string());
        let body = serde_json::to_string_pretty(&dict)?;
        let tmp = file.with_extension("json.tmp");
        std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &file).with_context(|| format!("replacing {}", file.display()))?;
        info!(source, translated, flagged, "title mapping recorded");
        self.invalidate();
        Ok(())
    }
}

const GENRES: &[(&str, &str)] = &[
    ("ファンタジー", "판타지"),
    ("恋愛", "연애"),
    ("アクション", "액션"),
    ("ドラマ", "드라마"),
    ("ホラー", "호러"),
    ("ミステリー", "미스터리"),
    ("スポーツ", "스포츠"),
    ("グルメ", "요리"),
    ("日常", "일상"),
    ("TL", "TL"),
    ("BL", "BL"),
    ("裏社会", "뒷세계"),
    ("アングラ", "언더그라운드"),
    ("ホラー・ミステリー", "호러/미스터리"),
    ("裏社会・アングラ", "뒷세계/언더그라운드"),
    ("コメディ", "코미디"),
    ("サスペンス", "서스펜스"),
    ("SF", "SF"),
    ("ヒューマンドラマ", "휴먼드라마"),
    ("学園", "학원"),
    ("恋愛ドラマ", "연애드라마"),
    ("ハートフル", "훈훈"),
    ("復讐", "복수"),
    ("異世界", "이세계"),
    ("転生", "전생"),
    ("冒険", "모험"),
    ("バトル", "배틀"),
    ("格闘", "격투"),
    ("歴史", "역사"),
    ("時代劇", "시대극"),
    ("推理", "추리"),
    ("探偵", "탐정"),
    ("サバイバル", "서바이벌"),
    ("ゾンビ", "좀비"),
    ("医療", "의료"),
    ("料理", "요리"),
    ("音楽", "음악"),
    ("芸能", "연예"),
    ("ビジネス", "비즈니스"),
    ("お仕事", "직업"),
    ("家族", "가족"),
    ("友情", "우정"),
    ("青春", "청춘"),
    ("成長", "성장"),
    ("職業", "직업"),
    ("日常系", "일상계"),
    ("癒し", "힐링"),
    ("感動", "감동"),
    ("泣ける", "눈물"),
    ("ギャグ", "개그"),
    ("ラブコメ", "러브코미디"),
];

fn translate_genre_part(part: &str) -> String {
    if let Some((_, t)) = GENRES.iter().find(|(k, _)| *k == part) {
        return t.to_string();
    }
    GENRES
        .iter()
        .filter(|(k, _)| part.contains(k))
        .max_by_key(|(k, _)| k.chars().count())
        .map(|(_, t)| t.to_string())
        .unwrap_or_else(|| part.to_string())
}

/// Translates a platform genre label. Compound labels split on `/` are
/// translated part by part; unknown parts are kept verbatim.
pub fn translate_genre(genre: &str) -> String {
    let genre = genre.trim();
    if genre.is_empty() {
        return String::new();
    }
    if !genre.contains('/') {
        return translate_genre_part(genre);
    }
    genre
        .split('/')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(translate_genre_part)
        .collect::<Vec<_>>()
        .join(" / ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings() -> TitleMappings {
        let mut m = TitleMappings::default();
        m.flagged.insert("俺だけレベルアップな件".into(), "나 혼자만 레벨업".into());
        m.general.insert("Tower of God".into(), "신의 탑".into());
        m.general.insert("外科医エリーゼ".into(), "외과의사 엘리제".into());
        m.general.insert("魔女".into(), "마녀".into());
        m
    }

    #[test]
    fn cascade_stages() {
        let m = mappings();
        let hit = |t: &str| m.lookup(t, DEFAULT_SUBSTRING_MIN_CHARS).map(|x| x.translated);

        assert_eq!(hit("Tower of God").as_deref(), Some("신의 탑"));
        assert_eq!(hit("TOWER OF GOD").as_deref(), Some("신의 탑"));
        assert_eq!(hit("外科医エリーゼ【単話版】").as_deref(), Some("외과의사 엘리제"));
        assert_eq!(hit("Ｔｏｗｅｒ　ｏｆ　Ｇｏｄ").as_deref(), Some("신의 탑"));
        assert_eq!(hit("外科医エリーゼ 外伝").as_deref(), Some("외과의사 엘리제"));
        // two-character key never matches by containment
        assert_eq!(hit("魔女と野獣"), None);
        assert_eq!(hit(""), None);
    }

    #[test]
    fn flagged_dictionary_sets_flag() {
        let m = mappings();
        let t = m.lookup("俺だけレベルアップな件 (5)", 4).unwrap();
        assert_eq!(t.translated, "나 혼자만 레벨업");
        assert!(t.flagged);
        assert!(!m.lookup("Tower of God", 4).unwrap().flagged);
    }

    #[test]
    fn substring_minimum_is_configurable() {
        let m = mappings();
        assert_eq!(m.lookup("魔女と野獣", 2).map(|t| t.translated).as_deref(), Some("마녀"));
    }

    #[test]
    fn record_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TitleMappingCache::new(dir.path(), 4);
        assert!(cache.lookup("薬屋のひとりごと").is_none());

        cache.record("薬屋のひとりごと", "약사의 혼잣말", false).unwrap();
        assert_eq!(
            cache.lookup("薬屋のひとりごと").map(|t| t.translated).as_deref(),
            Some("약사의 혼잣말")
        );

        cache.record("再婚承認を要求します", "재혼 황후", true).unwrap();
        assert!(cache.is_flagged("再婚承認を要求します"));
        assert_eq!(cache.snapshot().len(), 2);
    }

    #[test]
    fn record_refuses_to_overwrite_a_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(TITLE_MAPPINGS_FILE);
        let broken = "{\"外科医エリーゼ\": \"외과의사 엘리제\",,}";
        std::fs::write(&file, broken).unwrap();

        let cache = TitleMappingCache::new(dir.path(), 4);
        assert!(cache.record("薬屋のひとりごと", "약사의 혼잣말", false).is_err());
        assert_eq!(std::fs::read_to_string(&file).unwrap(), broken);
        assert!(cache.lookup("外科医エリーゼ").is_none());

        // the flagged file is absent, which is just an empty dictionary
        std::fs::write(&file, "{\"外科医エリーゼ\": \"외과의사 엘리제\"}").unwrap();
        cache.record("俺だけレベルアップな件", "나 혼자만 레벨업", true).unwrap();
        assert_eq!(cache.snapshot().len(), 2);
    }

    #[test]
    fn genres_translate_part_by_part() {
        assert_eq!(translate_genre("ファンタジー"), "판타지");
        assert_eq!(translate_genre("ファンタジー / アクション"), "판타지 / 액션");
        assert_eq!(translate_genre("恋愛/未知"), "연애 / 未知");
        assert_eq!(translate_genre("ホラー・ミステリー"), "호러/미스터리");
        assert_eq!(translate_genre("異世界ファンタジー"), "판타지");
        assert_eq!(translate_genre(""), "");
    }
}
