//! Shell program generation for step scripts.
//!
//! Script lines are compiled into a traced shell program: every command
//! is echoed with a `+ ` prefix before it runs, `set -e` stops the
//! program at the first failing line, and the wrapper records the exit
//! code to a file so the executor can read it back after the exec
//! session ends. An ASCII group separator precedes each trace so the log
//! reader can split the stream into per-command chunks and inject
//! timing.
//!
//! A line whose trimmed form equals the breakpoint marker splits the
//! program; execution pauses between the resulting segments.

use uuid::Uuid;

use crate::config::{SCRIPTS_DIR, TEMP_DIR};
use crate::utils::escape_shell_string;

/// Sentinel line that suspends execution for interactive inspection.
pub const BREAKPOINT_MARKER: &str = "# pipeline-runner[breakpoint]";

/// Separates command traces in the output stream.
pub const GROUP_SEPARATOR: char = '\u{1d}';
const ESCAPED_GROUP_SEPARATOR: &str = "\\x1d";

/// A generated file to upload into the container's scripts directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub name: String,
    pub content: String,
}

/// One uploadable, executable program segment.
#[derive(Debug, Clone)]
pub struct RemoteScript {
    /// Absolute in-container path of the wrapper to execute.
    pub entrypoint: String,
    /// Absolute in-container path of the exit code file.
    pub exit_code_file: String,
    pub files: Vec<ScriptFile>,
}

/// What the executor does next: run a program segment or pause.
#[derive(Debug, Clone)]
pub enum ScriptAction {
    Run(RemoteScript),
    Breakpoint,
}

/// Compiles script lines into an ordered list of actions, splitting at
/// breakpoint markers.
pub fn plan_script(lines: &[String]) -> Vec<ScriptAction> {
    let mut actions = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in lines {
        if line.trim() == BREAKPOINT_MARKER {
            if !current.is_empty() {
                actions.push(ScriptAction::Run(build_remote_script(&current)));
                current.clear();
            }
            actions.push(ScriptAction::Breakpoint);
        } else {
            current.push(line.clone());
        }
    }

    if !current.is_empty() {
        actions.push(ScriptAction::Run(build_remote_script(&current)));
    }

    actions
}

fn build_remote_script(lines: &[String]) -> RemoteScript {
    let traced = add_traces(lines);
    let token = Uuid::new_v4().simple().to_string();

    let sh_name = format!("shell_script-{token}.sh");
    let bash_name = format!("bash_script-{token}.sh");
    let wrapper_name = format!("wrapper_script-{token}.sh");
    let exit_code_file = format!("{TEMP_DIR}/exit_code-{token}");

    let sh_path = format!("{SCRIPTS_DIR}/{sh_name}");
    let bash_path = format!("{SCRIPTS_DIR}/{bash_name}");
    let wrapper_path = format!("{SCRIPTS_DIR}/{wrapper_name}");

    let files = vec![
        ScriptFile {
            name: sh_name,
            content: format!("#! /bin/sh\nset -e\n{traced}\n"),
        },
        ScriptFile {
            name: bash_name,
            content: format!("#! /bin/bash\nset -e\nset +H\n{traced}\n"),
        },
        ScriptFile {
            name: wrapper_name,
            content: make_wrapper(&sh_path, &bash_path, &exit_code_file),
        },
    ];

    RemoteScript {
        entrypoint: wrapper_path,
        exit_code_file,
        files,
    }
}

/// Prefixes each non-empty line with its trace echo. A printf emits the
/// group separator plus `+ <command>` so the reader can find command
/// boundaries.
fn add_traces(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| {
            format!(
                "printf \"{ESCAPED_GROUP_SEPARATOR}+ {}\\n\"\n{line}",
                escape_shell_string(line)
            )
        })
        .collect::<Vec<_>>()
        .join("\nprintf \"\\n\"\n")
}

/// Bash is preferred when the image ships it; either way the segment's
/// exit code lands in the exit code file and propagates.
fn make_wrapper(sh_path: &str, bash_path: &str, exit_code_file: &str) -> String {
    [
        "#! /bin/sh".to_string(),
        "if [ -f /bin/bash ]; then".to_string(),
        format!("    /bin/bash {bash_path}"),
        format!("    echo $? > {exit_code_file}"),
        "    exit $?".to_string(),
        "else".to_string(),
        format!("    /bin/sh {sh_path}"),
        format!("    echo $? > {exit_code_file}"),
        "    exit $?".to_string(),
        "fi".to_string(),
    ]
    .join("\n")
}
