use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use log::debug;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("template file not readable: {0}")]
    Template(#[source] std::io::Error),

    #[error("no value for template placeholder(s): {0}")]
    MissingValue(String),

    #[error("could not write job script: {0}")]
    Write(#[source] std::io::Error),
}

/// Generate a batch script by filling `{placeholder}` slots in a template
/// with the given values. The script is written to `output_path`, which the
/// submit command is pointed at afterwards.
pub fn generate_job_script(
    args: &HashMap<String, String>,
    template_path: &Path,
    output_path: &Path,
) -> Result<(), ScriptError> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder =
        PLACEHOLDER.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap());

    let template = std::fs::read_to_string(template_path).map_err(ScriptError::Template)?;

    let mut missing = Vec::new();
    let script = placeholder.replace_all(&template, |captures: &regex::Captures| {
        match args.get(&captures[1]) {
            Some(value) => value.clone(),
            None => {
                missing.push(captures[1].to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        missing.dedup();
        return Err(ScriptError::MissingValue(missing.join(", ")));
    }

    std::fs::write(output_path, script.as_bytes()).map_err(ScriptError::Write)?;
    debug!("Job script generated at {}", output_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn placeholders_are_filled() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.sh");
        let output = dir.path().join("job.sh");
        std::fs::write(
            &template,
            "#!/bin/bash\n#SBATCH -J {job_name}\nzumis -y {yaml_path}\n",
        )
        .unwrap();

        generate_job_script(
            &args(&[("job_name", "P1_S1"), ("yaml_path", "/data/p1/s1.yaml")]),
            &template,
            &output,
        )
        .unwrap();

        let script = std::fs::read_to_string(&output).unwrap();
        assert!(script.contains("#SBATCH -J P1_S1"));
        assert!(script.contains("zumis -y /data/p1/s1.yaml"));
    }

    #[test]
    fn missing_placeholder_value_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.sh");
        let output = dir.path().join("job.sh");
        std::fs::write(&template, "run {tool} on {input}\n").unwrap();

        let result = generate_job_script(&args(&[("tool", "zumis")]), &template, &output);
        assert!(matches!(result, Err(ScriptError::MissingValue(_))));
        assert!(!output.exists());
    }

    #[test]
    fn missing_template_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = generate_job_script(
            &args(&[]),
            &dir.path().join("nope.sh"),
            &dir.path().join("out.sh"),
        );
        assert!(matches!(result, Err(ScriptError::Template(_))));
    }
}
