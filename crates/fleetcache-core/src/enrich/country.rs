//! Canonical country names for free-text directory values.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::models::UNKNOWN_COUNTRY;

/// Canonical English names, each followed by the spellings that map to it:
/// ISO codes, common abbreviations and native-language names.
const COUNTRIES: &[(&str, &[&str])] = &[
    ("United States", &["us", "usa", "u.s.", "u.s.a.", "united states of america", "america", "estados unidos"]),
    ("United Kingdom", &["uk", "gb", "gbr", "u.k.", "great britain", "britain", "england", "scotland", "wales", "northern ireland"]),
    ("Germany", &["de", "deu", "deutschland", "allemagne", "alemania"]),
    ("France", &["fr", "fra", "république française", "republique francaise"]),
    ("Spain", &["es", "esp", "españa", "espana", "espagne"]),
    ("Italy", &["it", "ita", "italia", "italie"]),
    ("Netherlands", &["nl", "nld", "the netherlands", "holland", "nederland"]),
    ("Belgium", &["be", "bel", "belgië", "belgie", "belgique", "belgien"]),
    ("Switzerland", &["ch", "che", "schweiz", "suisse", "svizzera"]),
    ("Austria", &["at", "aut", "österreich", "osterreich", "oesterreich"]),
    ("Ireland", &["ie", "irl", "éire", "eire"]),
    ("Portugal", &["pt", "prt"]),
    ("Poland", &["pl", "pol", "polska"]),
    ("Sweden", &["se", "swe", "sverige"]),
    ("Norway", &["no", "nor", "norge"]),
    ("Denmark", &["dk", "dnk", "danmark"]),
    ("Finland", &["fi", "fin", "suomi"]),
    ("Czechia", &["cz", "cze", "czech republic", "česko", "cesko"]),
    ("Greece", &["gr", "grc", "ελλάδα", "hellas"]),
    ("Canada", &["ca", "can"]),
    ("Mexico", &["mx", "mex", "méxico"]),
    ("Brazil", &["br", "bra", "brasil"]),
    ("Argentina", &["ar", "arg"]),
    ("Chile", &["cl", "chl"]),
    ("Colombia", &["co", "col"]),
    ("Australia", &["au", "aus"]),
    ("New Zealand", &["nz", "nzl", "aotearoa"]),
    ("Japan", &["jp", "jpn", "nippon", "日本"]),
    ("China", &["cn", "chn", "prc", "people's republic of china", "中国"]),
    ("India", &["in", "ind", "bharat"]),
    ("Singapore", &["sg", "sgp"]),
    ("South Korea", &["kr", "kor", "korea", "republic of korea", "대한민국"]),
    ("Israel", &["il", "isr"]),
    ("United Arab Emirates", &["ae", "are", "uae", "u.a.e."]),
    ("South Africa", &["za", "zaf", "rsa"]),
    ("Turkey", &["tr", "tur", "türkiye", "turkiye"]),
    ("Ukraine", &["ua", "ukr", "україна"]),
    ("Philippines", &["ph", "phl"]),
];

fn alias_table() -> &'static HashMap<String, &'static str> {
    static TABLE: OnceLock<HashMap<String, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        for (canonical, aliases) in COUNTRIES {
            table.insert(canonical.to_lowercase(), *canonical);
            for alias in *aliases {
                table.insert(alias.to_lowercase(), *canonical);
            }
        }
        table
    })
}

/// Map a free-text country to its canonical English name. Empty or
/// unrecognized input yields `"Unknown"`.
pub fn normalize_country(raw: &str) -> String {
    let key = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if key.is_empty() {
        return UNKNOWN_COUNTRY.to_string();
    }
    alias_table()
        .get(&key)
        .map(|canonical| canonical.to_string())
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
}
