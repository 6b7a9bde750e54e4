//! Language registry for compilation and execution
//!
//! Maps a language tag (or alias, or source file extension) to its source
//! file convention, compiler invocation and run command.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// Canonical language tag (e.g., "cpp17")
    pub name: String,
    /// Name of the source file inside the box (e.g., "main.cpp")
    pub source_file: String,
    /// Compile command (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command, executed from the box working directory
    pub run_command: Vec<String>,
    /// File produced by compilation that is kept as the artifact
    pub artifact: String,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
}

impl LanguageConfig {
    /// Adjusted time limit in milliseconds for a problem's base limit;
    /// `None` when the result does not fit
    pub fn calculate_time_limit(&self, base_time_ms: u64) -> Option<u64> {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_time_ms
                .checked_mul(multiplier as u64)?
                .checked_add(bonus_seconds as u64 * 1000),
            None => Some(base_time_ms),
        }
    }

    /// Adjusted memory limit in KB for a problem's base limit;
    /// `None` when the result does not fit
    pub fn calculate_memory_limit(&self, base_memory_kb: u64) -> Option<u64> {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_memory_kb
                .checked_mul(multiplier as u64)?
                .checked_add(bonus_mb as u64 * 1024),
            None => Some(base_memory_kb),
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compile_command.is_some()
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    artifact: Option<String>,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Registry of every language the judge can compile and run
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageConfig>,
    extensions: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Registry built from the bundled `files/languages.toml`
    pub fn builtin() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut registry = Self::default();

        for (name, raw) in raw_configs {
            let parse_limit =
                |raw_limit: Vec<String>, kind: &str| -> anyhow::Result<Option<(u32, u32)>> {
                    if raw_limit.is_empty() {
                        return Ok(None);
                    }
                    if raw_limit.len() != 2 {
                        anyhow::bail!("Invalid {} limit for {}: {:?}", kind, name, raw_limit);
                    }
                    let multiplier = raw_limit[0].parse::<u32>().with_context(|| {
                        format!("Invalid {} multiplier for {}: {}", kind, name, raw_limit[0])
                    })?;
                    let offset = raw_limit[1].parse::<u32>().with_context(|| {
                        format!("Invalid {} offset for {}: {}", kind, name, raw_limit[1])
                    })?;
                    Ok(Some((multiplier, offset)))
                };

            let name = name.to_lowercase();
            let compile_command = raw.compile_command.map(|cmd| into_command(&cmd));
            let artifact = match raw.artifact {
                Some(artifact) => artifact,
                None if compile_command.is_some() => "main".to_string(),
                None => raw.source_file.clone(),
            };

            let config = LanguageConfig {
                name: name.clone(),
                source_file: raw.source_file,
                compile_command,
                run_command: into_command(&raw.run_command),
                artifact,
                time_limit: parse_limit(raw.time_limit, "time")?,
                memory_limit: parse_limit(raw.memory_limit, "memory")?,
            };

            for ext in raw.extensions {
                let ext = ext.trim_start_matches('.').to_lowercase();
                if let Some(previous) = registry.extensions.insert(ext.clone(), name.clone()) {
                    anyhow::bail!(
                        "Extension .{} is claimed by both {} and {}",
                        ext,
                        previous,
                        name
                    );
                }
            }

            for alias in raw.aliases {
                registry
                    .languages
                    .insert(alias.to_lowercase(), config.clone());
            }
            registry.languages.insert(name, config);
        }

        Ok(registry)
    }

    /// Look up a language by tag or alias
    pub fn get(&self, language: &str) -> Option<&LanguageConfig> {
        self.languages.get(&language.to_lowercase())
    }

    /// Look up the language of a source file by its extension
    pub fn by_filename(&self, filename: &str) -> Option<&LanguageConfig> {
        let ext = Path::new(filename).extension()?.to_str()?.to_lowercase();
        let name = self.extensions.get(&ext)?;
        self.languages.get(name)
    }

    /// All registered tags and aliases
    pub fn names(&self) -> Vec<String> {
        self.languages.keys().cloned().collect()
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
