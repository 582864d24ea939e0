use std::collections::BTreeMap;

/// Section name used internally for keys that appear before any `[Section]`
/// header. Never emitted.
const GLOBAL_SECTION: &str = "__global__";

/// A parsed Windows INI document: section-keyed maps plus the original
/// section ordering. Values are stored verbatim, no escaping is applied in
/// either direction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IniDocument {
    sections: BTreeMap<String, BTreeMap<String, String>>,
    order: Vec<String>,
}

impl IniDocument {
    pub fn parse(content: &str) -> IniDocument {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut current = GLOBAL_SECTION.to_owned();

        sections.insert(current.clone(), BTreeMap::new());
        order.push(current.clone());

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].to_owned();
                if !sections.contains_key(&current) {
                    sections.insert(current.clone(), BTreeMap::new());
                    order.push(current.clone());
                }
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                if let Some(section) = sections.get_mut(&current) {
                    section.insert(key.trim().to_owned(), value.trim().to_owned());
                }
            }
        }

        IniDocument { sections, order }
    }

    pub fn stringify(&self) -> String {
        let mut out = String::new();

        for name in &self.order {
            if let Some(entries) = self.sections.get(name) {
                if entries.is_empty() {
                    continue;
                }

                if name != GLOBAL_SECTION {
                    if !out.is_empty() {
                        out.push_str("\r\n");
                    }
                    out.push_str(&format!("[{}]\r\n", name));
                }

                for (key, value) in entries {
                    out.push_str(&format!("{}={}\r\n", key, value));
                }
            }
        }

        out
    }

    /// Two-level deep merge: sections union, entries union, `other` wins on
    /// conflicts. Values are replaced whole, never merged.
    pub fn merge(&self, other: &IniDocument) -> IniDocument {
        let mut merged = self.clone();

        for name in &other.order {
            if !merged.order.contains(name) {
                merged.order.push(name.clone());
            }
        }

        for (name, entries) in &other.sections {
            let target = merged.sections.entry(name.clone()).or_default();
            for (key, value) in entries {
                target.insert(key.clone(), value.clone());
            }
        }

        merged
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        if !self.sections.contains_key(section) {
            self.sections.insert(section.to_owned(), BTreeMap::new());
            self.order.push(section.to_owned());
        }
        if let Some(entries) = self.sections.get_mut(section) {
            entries.insert(key.to_owned(), value.into());
        }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.values().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reads_sections_and_entries() {
        let content = "[ServerSettings]\r\nMaxPlayers=70\r\nSessionName=Test\r\n";
        let doc = IniDocument::parse(content);
        assert_eq!(doc.get("ServerSettings", "MaxPlayers"), Some("70"));
        assert_eq!(doc.get("ServerSettings", "SessionName"), Some("Test"));
    }

    #[test]
    fn merge_overrides_whole_values_and_preserves_rest() {
        let base = IniDocument::parse(
            "[ServerSettings]\r\nMaxPlayers=70\r\nTamingSpeedMultiplier=2.0\r\n[MessageOfTheDay]\r\nMessage=Hello\r\n",
        );
        let overrides = IniDocument::parse("[ServerSettings]\r\nMaxPlayers=50\r\n");
        let merged = base.merge(&overrides);

        assert_eq!(merged.get("ServerSettings", "MaxPlayers"), Some("50"));
        assert_eq!(
            merged.get("ServerSettings", "TamingSpeedMultiplier"),
            Some("2.0")
        );
        assert_eq!(merged.get("MessageOfTheDay", "Message"), Some("Hello"));
    }

    #[test]
    fn stringify_parse_round_trip_is_stable() {
        let mut doc = IniDocument::default();
        doc.set("ServerSettings", "MaxPlayers", "70");
        doc.set("ServerSettings", "RCONEnabled", "True");
        doc.set("SessionSettings", "SessionName", "C1-Isle");

        let once = doc.stringify();
        let twice = IniDocument::parse(&once).stringify();
        assert_eq!(once, twice);
    }

    #[test]
    fn comments_and_blanks_are_dropped() {
        let doc = IniDocument::parse("; comment\r\n\r\n# also comment\r\n[S]\r\nk=v\r\n");
        assert_eq!(doc.get("S", "k"), Some("v"));
        assert_eq!(doc.stringify(), "[S]\r\nk=v\r\n");
    }

    #[test]
    fn bracketed_keys_survive() {
        let doc = IniDocument::parse("[S]\r\nPerLevelStatsMultiplier_Player[0]=2.0\r\n");
        assert_eq!(doc.get("S", "PerLevelStatsMultiplier_Player[0]"), Some("2.0"));
    }
}
