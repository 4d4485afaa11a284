use std::collections::HashMap;

/// Profile data resolved for an authenticated identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub display_name: String,
}

/// Resolves identities to display profiles.
pub trait Directory: Send + Sync {
    fn lookup_profile(&self, identity: &str) -> Profile;
}

/// Fixed identity-to-name table. Unknown identities resolve to "Guest".
#[derive(Debug, Default)]
pub struct StaticDirectory {
    profiles: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, identity: &str, display_name: &str) -> Self {
        self.profiles
            .insert(identity.to_string(), display_name.to_string());
        self
    }
}

impl Directory for StaticDirectory {
    fn lookup_profile(&self, identity: &str) -> Profile {
        let display_name = self
            .profiles
            .get(identity)
            .cloned()
            .unwrap_or_else(|| "Guest".to_string());
        Profile { display_name }
    }
}
