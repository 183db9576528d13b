use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(MessageId);
id_newtype!(MembershipId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    pub fn from_str_or_member(raw: &str) -> Self {
        match raw {
            "admin" => Role::Admin,
            _ => Role::Member,
        }
    }
}

/// Lowercase-hyphenated, URL-safe slug derived from a display name.
/// Runs of non-alphanumeric characters collapse into a single hyphen.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Random opaque slug for groups created without a display name.
pub fn random_slug(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_lowercases_and_hyphenates() {
        assert_eq!(slugify("Movie Fans"), "movie-fans");
        assert_eq!(slugify("  Friday --- Night!  "), "friday-night");
        assert_eq!(slugify("horror2024"), "horror2024");
    }

    #[test]
    fn slugify_drops_leading_and_trailing_separators() {
        assert_eq!(slugify("!!fans!!"), "fans");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn random_slugs_are_distinct() {
        assert_ne!(random_slug("private-group"), random_slug("private-group"));
    }
}
