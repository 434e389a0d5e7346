use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];
/// Artwork libraries are usually flat or artist/album shaped.
const SEARCH_DEPTH: usize = 3;

/// Resolves a usable local artwork file for a track: escalating fuzzy
/// filename matches over the configured directories first, the player's own
/// art URL as a fallback.
pub struct ArtworkResolver {
    dirs: Vec<PathBuf>,
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl ArtworkResolver {
    pub fn new(dirs: Vec<PathBuf>, client: reqwest::Client) -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .context("failed to determine cache directory")?
            .join("lumabeat")
            .join("artwork");
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            dirs,
            client,
            cache_dir,
        })
    }

    /// Best-effort artwork path. Local library first, then the source's own
    /// art URL (local file or remote fetch).
    pub async fn resolve(
        &self,
        artist: &str,
        title: &str,
        raw_title: &str,
        art_url: &str,
    ) -> Result<PathBuf> {
        if let Some(path) = self.find_local(artist, title, raw_title) {
            return Ok(path);
        }

        if let Some(stripped) = art_url.strip_prefix("file://") {
            let path = PathBuf::from(percent_decode(stripped));
            if path.is_file() {
                return Ok(path);
            }
        } else if art_url.starts_with("http://") || art_url.starts_with("https://") {
            return self.fetch(art_url).await;
        }

        anyhow::bail!("no artwork found for {artist} - {title}")
    }

    /// Escalating match ladder, precision over recall: each looser pattern
    /// only fires when every stricter one found nothing.
    pub fn find_local(&self, artist: &str, title: &str, raw_title: &str) -> Option<PathBuf> {
        let files = self.image_files();
        if files.is_empty() {
            return None;
        }

        let artist = artist.to_lowercase();
        let title = title.to_lowercase();
        let raw = raw_title.to_lowercase();
        let squash = |s: &str| s.replace(' ', "");
        let strip = |s: &str| {
            s.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        };

        type Matcher<'a> = Box<dyn Fn(&str) -> bool + 'a>;
        let mut ladder: Vec<Matcher> = Vec::new();

        if !artist.is_empty() && !title.is_empty() {
            let (a, t) = (artist.clone(), title.clone());
            ladder.push(Box::new(move |stem| stem.contains(&a) && stem.contains(&t)));
            let (a, t) = (squash(&artist), squash(&title));
            ladder.push(Box::new(move |stem| {
                let s = stem.replace(' ', "");
                s.contains(&a) && s.contains(&t)
            }));
        }
        if !raw.is_empty() {
            let r = raw.clone();
            ladder.push(Box::new(move |stem| stem.contains(&r)));
        }
        if !artist.is_empty() && !title.is_empty() {
            let (a, t) = (strip(&artist), strip(&title));
            if !a.is_empty() && !t.is_empty() {
                ladder.push(Box::new(move |stem| {
                    let s = strip(stem);
                    s.contains(&a) && s.contains(&t)
                }));
            }
        }
        // Titles like "Artist - Track": both halves, either order.
        if let Some((left, right)) = raw.split_once(" - ") {
            let (l, r) = (left.trim().to_string(), right.trim().to_string());
            if !l.is_empty() && !r.is_empty() {
                ladder.push(Box::new(move |stem| stem.contains(&l) && stem.contains(&r)));
            }
        }

        for matcher in ladder {
            if let Some(hit) = files.iter().find(|(_, stem)| matcher(stem)) {
                return Some(hit.0.clone());
            }
        }
        None
    }

    fn image_files(&self) -> Vec<(PathBuf, String)> {
        let mut files = Vec::new();
        for dir in &self.dirs {
            for entry in WalkDir::new(dir)
                .max_depth(SEARCH_DEPTH)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let is_image = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false);
                if !is_image {
                    continue;
                }
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                files.push((path.to_path_buf(), stem));
            }
        }
        files.sort();
        files
    }

    async fn fetch(&self, url: &str) -> Result<PathBuf> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("artwork fetch failed: {url}"))?
            .error_for_status()
            .with_context(|| format!("artwork fetch rejected: {url}"))?;

        let ext = Path::new(url)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or("jpg");
        let name = format!("{:x}.{ext}", Sha256::digest(url.as_bytes()));
        let dest = self.cache_dir.join(name);

        let bytes = response.bytes().await.context("artwork body read failed")?;
        tokio::fs::write(&dest, &bytes)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))?;
        Ok(dest)
    }
}

/// Minimal %XX decoding for file:// art URLs. No pack crate covers this.
pub(crate) fn percent_decode(s: &str) -> String {
    fn hex(b: u8) -> Option<u8> {
        (b as char).to_digit(16).map(|d| d as u8)
    }
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with(files: &[&str]) -> (tempfile::TempDir, ArtworkResolver) {
        let dir = tempfile::tempdir().unwrap();
        for f in files {
            std::fs::write(dir.path().join(f), b"x").unwrap();
        }
        let resolver = ArtworkResolver::new(
            vec![dir.path().to_path_buf()],
            reqwest::Client::new(),
        )
        .unwrap();
        (dir, resolver)
    }

    #[test]
    fn exactish_match_wins_over_looser_ones() {
        let (_d, r) = resolver_with(&[
            "daft punk - around the world.jpg",
            "aroundtheworld.png",
        ]);
        let hit = r
            .find_local("Daft Punk", "Around the World", "Around the World")
            .unwrap();
        assert!(hit.to_string_lossy().ends_with("daft punk - around the world.jpg"));
    }

    #[test]
    fn space_insensitive_match_fires_second() {
        let (_d, r) = resolver_with(&["DaftPunk-AroundTheWorld.png"]);
        assert!(r
            .find_local("Daft Punk", "Around The World", "Around The World")
            .is_some());
    }

    #[test]
    fn punctuation_stripped_match() {
        let (_d, r) = resolver_with(&["acdc tnt.jpg"]);
        assert!(r.find_local("AC/DC", "T.N.T.", "T.N.T.").is_some());
    }

    #[test]
    fn delimiter_split_matches_either_order() {
        let (_d, r) = resolver_with(&["highway to hell by ac dc.jpg"]);
        assert!(r
            .find_local("", "", "AC DC - Highway to Hell")
            .is_some());
    }

    #[test]
    fn no_match_yields_none() {
        let (_d, r) = resolver_with(&["unrelated.jpg"]);
        assert!(r.find_local("Artist", "Song", "Artist - Song").is_none());
        assert!(r.find_local("", "", "").is_none());
    }

    #[test]
    fn non_images_are_ignored() {
        let (_d, r) = resolver_with(&["artist - song.txt"]);
        assert!(r.find_local("Artist", "Song", "Artist - Song").is_none());
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }
}
