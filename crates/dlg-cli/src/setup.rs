use anyhow::{Context, Result};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const CONFIG_TEMPLATE: &str = r#"# dlg configuration
#
# Every key is optional. Environment variables prefixed with DLG_ override
# this file, e.g. DLG_MODEL=gpt-4o or DLG_SAMPLING__TEMPERATURE=0.7.

# Chat completions endpoint. Point it at a relay to keep the key off this machine.
endpoint = "https://api.openai.com/v1/chat/completions"

# A literal key, "$ENV_VAR", or a variable id (bare number) holding the key.
# Leave unset when the relay supplies credentials.
api_key = "$OPENAI_API_KEY"

model = "gpt-3.5-turbo"
system_message = "Please answer in Japanese."

# Exchanges kept in memory; 0 sends only the current question.
retention = 10
stream = true

# Lines printed before the answer waits for Enter. 0 = unbounded.
# viewport_lines = 8

[sampling]
temperature = 1.0
top_p = 0.9
max_tokens = 512

# Variable ids used by the conversation.
[slots]
question = 1
answer = 2
memory = 3

# While this switch is on, answers are stored but not shown.
# hide_switch = 10

[display]
strip_chars = "「」"
line_break_length = 0
# newline = "<br>"
# expand_escapes = true

# Primer exchange sent after the system message.
# [example]
# user = "Who are you?"
# assistant = "I am the innkeeper of this village."

# Names for \N[n] and \P[n].
# [names]
# party = ["Aria", "Bram"]
# [names.actors]
# 1 = "Harold"
"#;

pub fn run() -> Result<()> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("dlg");

    let config_path = config_dir.join("config.toml");

    // Create directory if needed
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;

    if config_path.exists() {
        println!("Existing config file found:");
        println!("  {}", config_path.display());
        print!("\nOverwrite? (The existing file will be backed up) [y/N] ");

        // Flush stdout so the prompt appears before reading
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Setup cancelled.");
            return Ok(());
        }

        backup_file(&config_path)?;
    }

    std::fs::write(&config_path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Created {}", config_path.display());

    println!("\nNext steps:");
    println!("  1. Set your API key:  export OPENAI_API_KEY=\"sk-...\"");
    println!("  2. Start chatting:    dlg");
    println!("  3. Or ask once:       dlg ask \"hello\"");

    Ok(())
}

/// Back up a file to <name>.bak, appending a timestamp if .bak already exists.
fn backup_file(path: &Path) -> Result<()> {
    let mut backup = path.with_extension("toml.bak");

    if backup.exists() {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        backup = path.with_extension(format!("toml.bak.{}", timestamp));
    }

    std::fs::rename(path, &backup)
        .with_context(|| format!("Failed to back up {} to {}", path.display(), backup.display()))?;
    println!("  Backed up to {}", backup.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeySource, Config};

    #[test]
    fn test_template_parses_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, CONFIG_TEMPLATE).unwrap();

        let config = Config::load_from(&path).unwrap();
        let defaults = Config::default();
        assert_eq!(config.endpoint, defaults.endpoint);
        assert_eq!(config.model, defaults.model);
        assert_eq!(config.retention, defaults.retention);
        assert_eq!(
            config.api_key,
            Some(ApiKeySource::Literal("$OPENAI_API_KEY".to_string()))
        );
        assert_eq!(config.display, defaults.display);
    }

    #[test]
    fn test_backup_keeps_previous_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "first").unwrap();
        backup_file(&path).unwrap();
        std::fs::write(&path, "second").unwrap();
        backup_file(&path).unwrap();

        assert!(!path.exists());
        let backups = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(backups, 2);
    }
}
