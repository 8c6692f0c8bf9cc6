//! Decode profiles: per-field hints keyed by field full-name patterns.
//!
//! A pattern is either an exact field full name (`pkg.Msg.field`) or a
//! prefix ending in `*`. Later rules override earlier ones.

#[derive(Clone, Copy, Debug)]
pub struct FieldHints {
    /// Probability that this field occurs in a typical payload; fields with
    /// mean probability below 0.5 move to the cold region.
    pub decode_probability: f32,
    /// Expected element count for repeated fields; pre-sizes the slice on
    /// first append.
    pub expected_count: u32,
    /// Trust the producer and skip UTF-8 validation for this string field.
    pub assume_utf8: bool,
}

impl Default for FieldHints {
    fn default() -> Self {
        FieldHints {
            decode_probability: 1.0,
            expected_count: 0,
            assume_utf8: false,
        }
    }
}

#[derive(Clone, Debug)]
struct Rule {
    pattern: String,
    hints: FieldHints,
}

#[derive(Clone, Debug, Default)]
pub struct Profile {
    rules: Vec<Rule>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, pattern: &str, hints: FieldHints) -> Self {
        self.push(pattern, hints);
        self
    }

    pub fn push(&mut self, pattern: &str, hints: FieldHints) {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            hints,
        });
    }

    pub(crate) fn lookup(&self, full_name: &str) -> FieldHints {
        let mut hints = FieldHints::default();
        for rule in &self.rules {
            let hit = match rule.pattern.strip_suffix('*') {
                Some(prefix) => full_name.starts_with(prefix),
                None => full_name == rule.pattern,
            };
            if hit {
                hints = rule.hints;
            }
        }
        hints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_prefix_matching() {
        let p = Profile::new()
            .rule(
                "pkg.Msg.*",
                FieldHints {
                    decode_probability: 0.1,
                    ..Default::default()
                },
            )
            .rule(
                "pkg.Msg.hot",
                FieldHints {
                    decode_probability: 0.9,
                    ..Default::default()
                },
            );
        assert_eq!(p.lookup("pkg.Msg.rare").decode_probability, 0.1);
        assert_eq!(p.lookup("pkg.Msg.hot").decode_probability, 0.9);
        assert_eq!(p.lookup("other.Msg.x").decode_probability, 1.0);
    }
}
