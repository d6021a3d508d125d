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

use rust_stemmers::Algorithm;

/// Locale aware stemmer. Locales are resolved through an explicit
/// registry keyed by the primary language subtag, never by runtime
/// name lookup.
pub struct Stemmer(rust_stemmers::Stemmer);

fn primary_subtag(tag: &str) -> String {
    tag.split(['-', '_'])
        .next()
        .unwrap_or(tag)
        .to_ascii_lowercase()
}

impl Stemmer {
    pub fn for_locale(tag: &str) -> Option<Self> {
        let algorithm = match primary_subtag(tag).as_str() {
            "ar" => Algorithm::Arabic,
            "da" => Algorithm::Danish,
            "de" => Algorithm::German,
            "en" => Algorithm::English,
            "es" => Algorithm::Spanish,
            "fi" => Algorithm::Finnish,
            "fr" => Algorithm::French,
            "hu" => Algorithm::Hungarian,
            "it" => Algorithm::Italian,
            "nl" => Algorithm::Dutch,
            "no" => Algorithm::Norwegian,
            "pt" => Algorithm::Portuguese,
            "ro" => Algorithm::Romanian,
            "ru" => Algorithm::Russian,
            "sv" => Algorithm::Swedish,
            "ta" => Algorithm::Tamil,
            "tr" => Algorithm::Turkish,
            _ => return None,
        };

        Some(Self(rust_stemmers::Stemmer::create(algorithm)))
    }

    pub fn stem(&self, term: &str) -> String {
        self.0.stem(term).into_owned()
    }
}

/// Locale tag for a detected language. Languages without a dedicated
/// stemmer or gram length fall back to English.
pub fn locale_tag(lang: whatlang::Lang) -> &'static str {
    use whatlang::Lang;

    match lang {
        Lang::Ara => "ar",
        Lang::Dan => "da",
        Lang::Deu => "de",
        Lang::Spa => "es",
        Lang::Fin => "fi",
        Lang::Fra => "fr",
        Lang::Hun => "hu",
        Lang::Ita => "it",
        Lang::Nld => "nl",
        Lang::Nob => "no",
        Lang::Por => "pt",
        Lang::Ron => "ro",
        Lang::Rus => "ru",
        Lang::Swe => "sv",
        Lang::Tam => "ta",
        Lang::Tur => "tr",
        Lang::Cmn => "zh",
        Lang::Jpn => "ja",
        Lang::Kor => "ko",
        Lang::Tha => "th",
        _ => "en",
    }
}

/// Character n-gram length for locales whose scripts do not delimit
/// words with whitespace. Tokens in these locales are exploded into
/// overlapping n-grams instead of being stemmed.
pub fn char_gram_len(tag: &str) -> Option<usize> {
    match primary_subtag(tag).as_str() {
        "zh" => Some(2),
        "ko" => Some(2),
        "ja" => Some(3),
        "th" => Some(3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_stemming() {
        let stemmer = Stemmer::for_locale("en-US").unwrap();

        assert_eq!(stemmer.stem("running"), "run");
        assert_eq!(stemmer.stem("fox"), "fox");
    }

    #[test]
    fn unknown_locale_has_no_stemmer() {
        assert!(Stemmer::for_locale("zh-CN").is_none());
        assert!(Stemmer::for_locale("tlh").is_none());
    }

    #[test]
    fn gram_locales() {
        assert_eq!(char_gram_len("zh-CN"), Some(2));
        assert_eq!(char_gram_len("ja"), Some(3));
        assert_eq!(char_gram_len("en-US"), None);
    }
}
