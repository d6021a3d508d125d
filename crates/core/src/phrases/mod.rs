// Trawler is an open source distributed web crawler and search indexer.
// Copyright (C) 2024 Trawler
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Pure text canonicalization and term splitting. Used by the
//! crawl-time index builder and by the query pipeline, so everything
//! in here must stay deterministic and free of I/O.

use once_cell::sync::Lazy;
use regex::Regex;

pub mod parser;
pub mod stemmer;

use stemmer::Stemmer;

static ACRONYM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:[A-Za-z]\.){2,}").unwrap());
static AMPERSAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w)\s*&\s*(\w)").unwrap());
static URL_OR_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:https?|ftp)://[^\s]+|[^\s@:/]+@[^\s@:/]+\.[^\s@:/]+").unwrap()
});

/// Rewrites constructs that punctuation based splitting would
/// otherwise fragment: acronyms (`A.B.C.` becomes `_abc`), ampersand
/// joins (`AT&T` becomes `AT_and_T`) and URLs/e-mail addresses whose
/// punctuation is replaced with a sentinel underscore.
pub fn canonicalize(text: &str) -> String {
    let text = ACRONYM.replace_all(text, |caps: &regex::Captures| {
        let collapsed: String = caps[0]
            .chars()
            .filter(|c| *c != '.')
            .flat_map(|c| c.to_lowercase())
            .collect();
        format!("_{collapsed}")
    });

    let text = AMPERSAND.replace_all(&text, "${1}_and_${2}");

    URL_OR_EMAIL
        .replace_all(&text, |caps: &regex::Captures| {
            caps[0]
                .chars()
                .map(|c| {
                    if c.is_alphanumeric() || c == '_' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        })
        .into_owned()
}

/// Overlapping character n-grams of a single token. Tokens shorter
/// than `n` are kept whole.
pub fn char_grams(token: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = token.chars().collect();

    if chars.len() <= n {
        return vec![token.to_string()];
    }

    chars.windows(n).map(|w| w.iter().collect()).collect()
}

/// Splits canonicalized text into index terms for the given locale.
///
/// Locales with a configured character gram length are exploded into
/// overlapping n-grams; all other locales are lowercased and stemmed
/// when a stemmer exists for the locale.
pub fn tokenize(text: &str, locale: &str) -> Vec<String> {
    let canonical = canonicalize(text);
    let gram_len = stemmer::char_gram_len(locale);
    let stemmer = Stemmer::for_locale(locale);

    let mut terms = Vec::new();

    for raw in canonical.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if raw.is_empty() || raw.chars().all(|c| c == '_') {
            continue;
        }

        let token = raw.to_lowercase();

        match gram_len {
            Some(n) => terms.extend(char_grams(&token, n)),
            None => match &stemmer {
                Some(stemmer) => terms.push(stemmer.stem(&token)),
                None => terms.push(token),
            },
        }
    }

    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acronyms_collapse() {
        assert_eq!(canonicalize("the U.S.A. is"), "the _usa is");
    }

    #[test]
    fn ampersand_join() {
        assert_eq!(canonicalize("AT&T stock"), "AT_and_T stock");
        assert_eq!(canonicalize("a & b"), "a_and_b");
    }

    #[test]
    fn urls_survive_splitting() {
        let tokens = tokenize("see https://example.com/a/b.html now", "xx");

        assert!(tokens.contains(&"https___example_com_a_b_html".to_string()));
        assert!(tokens.contains(&"see".to_string()));
    }

    #[test]
    fn emails_survive_splitting() {
        let tokens = tokenize("mail bob@example.com today", "xx");

        assert!(tokens.contains(&"bob_example_com".to_string()));
    }

    #[test]
    fn english_tokens_are_stemmed() {
        assert_eq!(
            tokenize("The running foxes", "en"),
            vec!["the", "run", "fox"]
        );
    }

    #[test]
    fn gram_locale_explodes_tokens() {
        let tokens = tokenize("你好世界", "zh-CN");

        assert_eq!(tokens, vec!["你好", "好世", "世界"]);
    }

    #[test]
    fn short_token_kept_whole_in_gram_locale() {
        assert_eq!(char_grams("好", 2), vec!["好".to_string()]);
    }
}
