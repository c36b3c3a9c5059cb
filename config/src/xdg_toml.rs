//! `[env]` table from `$XDG_CONFIG_HOME/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::LoadError;

fn xdg_config_path(app_name: &str) -> Option<PathBuf> {
    // Explicit XDG_CONFIG_HOME wins (also what tests set); dirs covers the
    // platform default.
    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    let path = config_home.join(app_name).join("config.toml");
    path.is_file().then_some(path)
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Key-value pairs from the `[env]` section. Missing file or section is an
/// empty map.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let Some(path) = xdg_config_path(app_name) else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let config: ConfigFile = toml::from_str(&content)?;
    Ok(config.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn with_xdg_home<T>(dir: &std::path::Path, f: impl FnOnce() -> T) -> T {
        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", dir);
        let out = f();
        match prev {
            Some(p) => env::set_var("XDG_CONFIG_HOME", p),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }
        out
    }

    #[test]
    fn missing_config_is_an_empty_map() {
        let map = load_env_map("reploid-test-nonexistent-xyz").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn env_table_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("testapp");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("config.toml"), "[env]\nFOO = \"bar\"\n").unwrap();

        let map = with_xdg_home(dir.path(), || load_env_map("testapp")).unwrap();
        assert_eq!(map.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("badapp");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("config.toml"), "not toml [[[\n").unwrap();

        let result = with_xdg_home(dir.path(), || load_env_map("badapp"));
        assert!(matches!(result, Err(LoadError::XdgParse(_))));
    }

    #[test]
    fn config_without_env_section_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("noenv");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("config.toml"), "[other]\nk = \"v\"\n").unwrap();

        let map = with_xdg_home(dir.path(), || load_env_map("noenv")).unwrap();
        assert!(map.is_empty());
    }
}
