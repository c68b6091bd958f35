//! Interpreter line rewriting for launcher scripts.
//!
//! A `#!` line naming an absolute in-tree interpreter is replaced by a small
//! shell preamble that finds the interpreter relative to the script's own
//! resolved location and re-executes the script with it. The preamble is also
//! valid Python (everything after the first line is a string literal), so the
//! body of the script is kept unchanged.

use indoc::indoc;
use std::path::Path;

use super::Placement;
use crate::utils::relative_path;

/// First two lines shared by every generated preamble.
const PREAMBLE_MARKER: &str = "#!/bin/sh\n\"true\" ''''\n";

const LINUX_PREAMBLE: &str = indoc! {r#"
    #!/bin/sh
    "true" ''''
    "exec" "$(dirname "$(readlink -f "$0")")/{interpreter}" {args}"$0" "$@"
    '''
"#};

// BSD readlink has no -f, so the symlink chain is walked by hand.
const DARWIN_PREAMBLE: &str = indoc! {r#"
    #!/bin/sh
    "true" ''''
    script="$0"
    while [ -L "$script" ]; do
        link="$(readlink "$script")"
        case "$link" in
            /*) script="$link" ;;
            *) script="$(dirname "$script")/$link" ;;
        esac
    done
    here="$(cd "$(dirname "$script")" && pwd -P)"
    "exec" "$here/{interpreter}" {args}"$here/$(basename "$script")" "$@"
    '''
"#};

/// Which preamble to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherStyle {
    Linux,
    Darwin,
}

/// A parsed `#!` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shebang {
    pub interpreter: String,
    pub args: Option<String>,
}

/// Split a script into its interpreter line and the remaining bytes.
pub fn parse(data: &[u8]) -> Option<(Shebang, &[u8])> {
    let rest = data.strip_prefix(b"#!")?;
    let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
    let line = std::str::from_utf8(&rest[..end]).ok()?.trim();
    let body = rest.get(end + 1..).unwrap_or_default();

    let (interpreter, args) = match line.split_once(char::is_whitespace) {
        Some((interpreter, args)) => (interpreter, Some(args.trim().to_string())),
        None => (line, None),
    };
    if interpreter.is_empty() {
        return None;
    }
    Some((
        Shebang {
            interpreter: interpreter.to_string(),
            args: args.filter(|a| !a.is_empty()),
        },
        body,
    ))
}

/// Whether the script already carries a generated preamble.
pub fn is_relocated(data: &[u8]) -> bool {
    data.starts_with(PREAMBLE_MARKER.as_bytes())
}

/// Render the preamble for an interpreter at `relative` from the script's directory.
pub fn render(style: LauncherStyle, relative: &Path, args: Option<&str>) -> String {
    let template = match style {
        LauncherStyle::Linux => LINUX_PREAMBLE,
        LauncherStyle::Darwin => DARWIN_PREAMBLE,
    };
    let args: String = args
        .unwrap_or_default()
        .split_whitespace()
        .map(|arg| format!("{} ", quote(arg)))
        .collect();
    template
        .replace("{interpreter}", &relative.display().to_string())
        .replace("{args}", &args)
}

/// Single-quote `arg` for `sh`. The output never has three quotes in a row,
/// so the Python string opened by the preamble stays open.
fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// The rewritten script, or `None` if it is already portable or its
/// interpreter lives outside the tree.
pub fn fix(data: &[u8], placement: &Placement, style: LauncherStyle) -> Option<Vec<u8>> {
    if is_relocated(data) {
        return None;
    }
    let (shebang, body) = parse(data)?;
    let interpreter = placement.in_tree(Path::new(&shebang.interpreter))?;
    let relative = relative_path(placement.dir, &interpreter);

    let mut out = render(style, &relative, shebang.args.as_deref()).into_bytes();
    out.extend_from_slice(body);
    Some(out)
}
