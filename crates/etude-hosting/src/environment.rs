use std::path::{Path, PathBuf};

use crate::config::WebHostOptions;

/// Well-known environment names.
pub struct Environments;

impl Environments {
    pub const DEVELOPMENT: &'static str = "Development";
    pub const STAGING: &'static str = "Staging";
    pub const PRODUCTION: &'static str = "Production";
}

/// Where and as what the application is running.
#[derive(Debug, Clone)]
pub struct HostingEnvironment {
    pub application_name: String,
    pub environment_name: String,
    pub content_root: PathBuf,
    /// Resolved against the content root. `None` when neither configured nor
    /// present on disk as `wwwroot`.
    pub web_root: Option<PathBuf>,
}

impl HostingEnvironment {
    pub fn from_options(options: &WebHostOptions) -> Self {
        let content_root = match &options.content_root {
            Some(root) => absolute(Path::new(root)),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };

        let web_root = match &options.web_root {
            Some(root) => Some(content_root.join(root)),
            None => {
                let candidate = content_root.join("wwwroot");
                candidate.is_dir().then_some(candidate)
            }
        };

        let application_name = options
            .application_name
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned());

        HostingEnvironment {
            application_name,
            environment_name: options.environment.clone(),
            content_root,
            web_root,
        }
    }

    /// Compare against the current environment ignoring case.
    pub fn is_environment(&self, name: &str) -> bool {
        self.environment_name.eq_ignore_ascii_case(name)
    }

    pub fn is_development(&self) -> bool {
        self.is_environment(Environments::DEVELOPMENT)
    }

    pub fn is_staging(&self) -> bool {
        self.is_environment(Environments::STAGING)
    }

    pub fn is_production(&self) -> bool {
        self.is_environment(Environments::PRODUCTION)
    }
}

impl Default for HostingEnvironment {
    fn default() -> Self {
        HostingEnvironment::from_options(&WebHostOptions::default())
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn environment(pairs: &[(&str, &str)]) -> HostingEnvironment {
        let config = Configuration::from_pairs(pairs.iter().copied());
        HostingEnvironment::from_options(&WebHostOptions::new(&config, None))
    }

    #[test]
    fn test_defaults_to_production() {
        let env = environment(&[]);
        assert_eq!(env.environment_name, "Production");
        assert!(env.is_production());
        assert!(!env.is_development());
    }

    #[test]
    fn test_environment_checks_ignore_case() {
        let env = environment(&[("environment", "development")]);
        assert!(env.is_development());
        assert!(env.is_environment("DEVELOPMENT"));
        assert!(!env.is_staging());
    }

    #[test]
    fn test_web_root_resolves_against_content_root() {
        let root = std::env::temp_dir();
        let env = environment(&[
            ("contentRoot", root.to_str().unwrap()),
            ("webroot", "public"),
        ]);
        assert_eq!(env.content_root, root);
        assert_eq!(env.web_root, Some(root.join("public")));
    }

    #[test]
    fn test_application_name_from_settings() {
        let env = environment(&[("applicationName", "orders")]);
        assert_eq!(env.application_name, "orders");
    }
}
