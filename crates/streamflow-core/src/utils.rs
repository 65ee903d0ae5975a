//! Utility primitives shared by the connector and task-runner layers.
//!
//! Grounded in `streamflow/core/utils.py` from the original implementation,
//! reworked in the idiom of `wdl-engine`'s small free-function utility
//! modules (e.g. `convert_unit_string`).

use std::collections::HashSet;
use std::fmt::Write as _;

use indexmap::IndexMap;

/// The channel a command's stdout/stderr can be redirected to.
///
/// Mirrors the Python source's use of `asyncio.subprocess.STDOUT` as a
/// sentinel value distinct from any path: [`Stdio::Stdout`] means "the same
/// descriptor as a sibling stream", while [`Stdio::Path`] names a concrete
/// file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Stdio {
    /// Redirect to the process's stdout (or, for `stderr`, merge into
    /// whatever stdout was redirected to).
    #[default]
    Stdout,
    /// Redirect to a file at this path.
    Path(String),
}

/// The options accepted by [`create_command`].
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// The command and its arguments, joined with single spaces.
    ///
    /// Tokens are not quoted here; the caller is responsible for any
    /// quoting the command requires.
    pub command: Vec<String>,
    /// Environment variables to `export` before running the command, in
    /// insertion order.
    pub environment: IndexMap<String, String>,
    /// The working directory to `cd` into before running the command.
    pub workdir: Option<String>,
    /// The path to redirect stdin from.
    pub stdin: Option<String>,
    /// Where to redirect stdout.
    pub stdout: Stdio,
    /// Where to redirect stderr.
    pub stderr: Stdio,
}

/// Assembles a POSIX-shell one-liner from a structured command request.
///
/// Renders, in order: `cd <workdir> && `, `export K="V" && ` per environment
/// entry (insertion order preserved), the command tokens joined by spaces,
/// ` < <stdin>`, ` > <stdout>` (omitted when stdout is
/// [`Stdio::Stdout`]), and finally `2>&1` when stderr equals stdout or
/// ` 2> <stderr>` otherwise (omitted when stderr is [`Stdio::Stdout`]).
///
/// Deterministic: identical input always produces identical output.
pub fn create_command(options: &CommandOptions) -> String {
    let mut out = String::new();

    if let Some(workdir) = &options.workdir {
        let _ = write!(out, "cd {workdir} && ");
    }

    for (key, value) in &options.environment {
        let _ = write!(out, "export {key}=\"{value}\" && ");
    }

    out.push_str(&options.command.join(" "));

    if let Some(stdin) = &options.stdin {
        let _ = write!(out, " < {}", shlex::try_quote(stdin).unwrap_or_default());
    }

    if let Stdio::Path(path) = &options.stdout {
        let _ = write!(out, " > {}", shlex::try_quote(path).unwrap_or_default());
    }

    match (&options.stderr, &options.stdout) {
        (Stdio::Stdout, _) => {}
        (Stdio::Path(stderr_path), Stdio::Path(stdout_path)) if stderr_path == stdout_path => {
            out.push_str(" 2>&1");
        }
        (Stdio::Path(stderr_path), _) => {
            let _ = write!(out, " 2> {}", shlex::try_quote(stderr_path).unwrap_or_default());
        }
    }

    out
}

/// The default shell used to decode and run an [`encode_command`]-wrapped
/// command when none is specified.
pub const DEFAULT_SHELL: &str = "sh";

/// Wraps a command string as `echo <base64> | base64 -d | <shell>`.
///
/// This is the canonical form sent through [`crate::connector::Connector::run`]:
/// base64 round-trips arbitrary quoting, newlines, and shell metacharacters
/// through intermediate layers (ssh, `kubectl exec`, helper scripts).
pub fn encode_command(command: &str, shell: &str) -> String {
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(command.as_bytes());
    format!("echo {encoded} | base64 -d | {shell}")
}

/// A stack of name sets used for variable scoping during expression
/// evaluation.
///
/// Grounded in `streamflow/core/utils.py`'s `NamesStack`. Level 0 is the
/// outermost (global) scope; later levels shadow it.
#[derive(Debug, Default)]
pub struct ScopedNames {
    stack: Vec<HashSet<String>>,
}

impl ScopedNames {
    /// Constructs a stack with a single, empty global scope.
    pub fn new() -> Self {
        Self {
            stack: vec![HashSet::new()],
        }
    }

    /// Pushes a new, empty scope.
    pub fn push_scope(&mut self) {
        self.stack.push(HashSet::new());
    }

    /// Pops the innermost scope.
    ///
    /// # Panics
    ///
    /// Panics if called when only the global scope remains.
    pub fn pop_scope(&mut self) {
        assert!(self.stack.len() > 1, "cannot pop the global scope");
        self.stack.pop();
    }

    /// Adds a name to the innermost scope.
    pub fn add(&mut self, name: impl Into<String>) {
        self.stack
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.into());
    }

    /// Removes a name from the innermost scope.
    pub fn remove(&mut self, name: &str) {
        self.stack
            .last_mut()
            .expect("scope stack is never empty")
            .remove(name);
    }

    /// Returns `true` if `name` is visible at any level.
    pub fn contains(&self, name: &str) -> bool {
        self.stack.iter().any(|scope| scope.contains(name))
    }

    /// Returns the level-0 (global) names, minus any name shadowed by a
    /// deeper scope.
    pub fn global_names(&self) -> HashSet<String> {
        let mut names = self.stack[0].clone();
        for scope in &self.stack[1..] {
            for name in scope {
                names.remove(name);
            }
        }
        names
    }
}

/// Recursively flattens nested sequences, preserving left-to-right order and
/// scalar leaves.
///
/// An empty input returns an empty output. Idempotent on already-flat input.
pub fn flatten_list<T: Clone>(nested: &[FlattenNode<T>]) -> Vec<T> {
    let mut out = Vec::new();
    flatten_into(nested, &mut out);
    out
}

/// A node in a hierarchical sequence passed to [`flatten_list`].
#[derive(Debug, Clone)]
pub enum FlattenNode<T> {
    /// A scalar leaf, preserved as-is.
    Leaf(T),
    /// A nested sequence, recursively flattened.
    Nested(Vec<FlattenNode<T>>),
}

fn flatten_into<T: Clone>(nested: &[FlattenNode<T>], out: &mut Vec<T>) {
    for node in nested {
        match node {
            FlattenNode::Leaf(value) => out.push(value.clone()),
            FlattenNode::Nested(children) => flatten_into(children, out),
        }
    }
}

/// Generates a random, collision-free-in-practice name.
///
/// A version-4 UUID string, as in `streamflow/core/utils.py::random_name`.
pub fn random_name() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Renders a single CLI option the way `BaseConnector.get_option` does:
/// empty string when `value` is `None`/`false`, `--name ` (space-terminated)
/// for a `true` boolean when `name` is more than one character long,
/// `-name ` otherwise, `-name "value" ` for a string, and one repetition
/// per element for a sequence.
pub fn get_option(name: &str, value: &OptionValue) -> String {
    let flag = if name.len() > 1 {
        format!("--{name}")
    } else {
        format!("-{name}")
    };
    match value {
        OptionValue::Absent => String::new(),
        OptionValue::Bool(false) => String::new(),
        OptionValue::Bool(true) => format!("{flag} "),
        OptionValue::String(value) => format!("{flag} \"{value}\" "),
        OptionValue::Sequence(values) => values
            .iter()
            .map(|item| format!("{flag} \"{item}\" "))
            .collect(),
    }
}

/// The value types accepted by [`get_option`].
#[derive(Debug, Clone)]
pub enum OptionValue {
    /// No value was supplied; renders as an empty string.
    Absent,
    /// A boolean flag.
    Bool(bool),
    /// A single string value.
    String(String),
    /// A sequence of string values, each rendered as its own repetition of
    /// the flag.
    Sequence(Vec<String>),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<Option<String>> for OptionValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(value) => OptionValue::String(value),
            None => OptionValue::Absent,
        }
    }
}

impl From<Option<Vec<String>>> for OptionValue {
    fn from(value: Option<Vec<String>>) -> Self {
        match value {
            Some(values) => OptionValue::Sequence(values),
            None => OptionValue::Absent,
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn create_command_assembles_every_clause() {
        let mut environment = IndexMap::new();
        environment.insert("A".to_string(), "1".to_string());
        let options = CommandOptions {
            command: vec!["echo".to_string(), "hi".to_string()],
            environment,
            workdir: Some("/w".to_string()),
            stdin: Some("in.txt".to_string()),
            stdout: Stdio::Path("out.txt".to_string()),
            stderr: Stdio::Stdout,
        };
        assert_eq!(
            create_command(&options),
            r#"cd /w && export A="1" && echo hi < in.txt > out.txt"#
        );
    }

    #[test]
    fn create_command_is_deterministic() {
        let options = CommandOptions {
            command: vec!["echo".to_string(), "hi".to_string()],
            ..Default::default()
        };
        assert_eq!(create_command(&options), create_command(&options));
    }

    #[test]
    fn encode_command_round_trips_through_base64_and_shell() {
        let command = "echo hi";
        let wrapped = encode_command(command, DEFAULT_SHELL);
        assert!(wrapped.starts_with("echo "));
        assert!(wrapped.ends_with(" | base64 -d | sh"));
        let encoded = wrapped
            .strip_prefix("echo ")
            .unwrap()
            .strip_suffix(" | base64 -d | sh")
            .unwrap();
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), command);
    }

    #[test]
    fn flatten_list_is_order_preserving_and_idempotent() {
        let nested = vec![
            FlattenNode::Leaf(1),
            FlattenNode::Nested(vec![FlattenNode::Leaf(2), FlattenNode::Leaf(3)]),
            FlattenNode::Leaf(4),
        ];
        assert_eq!(flatten_list(&nested), vec![1, 2, 3, 4]);

        let flat: Vec<_> = flatten_list(&nested).into_iter().map(FlattenNode::Leaf).collect();
        assert_eq!(flatten_list(&flat), vec![1, 2, 3, 4]);
    }

    #[test]
    fn flatten_list_empty_is_empty() {
        assert_eq!(flatten_list::<i32>(&[]), Vec::<i32>::new());
    }

    #[test]
    fn scoped_names_global_names_excludes_shadowed() {
        let mut names = ScopedNames::new();
        names.add("a");
        names.add("b");
        names.push_scope();
        names.add("b");
        names.add("c");
        assert!(names.contains("a"));
        assert!(names.contains("c"));
        let global = names.global_names();
        assert!(global.contains("a"));
        assert!(!global.contains("b"));
        assert!(!global.contains("c"));
    }

    #[test]
    fn get_option_renders_by_kind() {
        assert_eq!(get_option("wait", &OptionValue::Bool(true)), "--wait ");
        assert_eq!(get_option("f", &OptionValue::Bool(true)), "-f ");
        assert_eq!(get_option("wait", &OptionValue::Bool(false)), "");
        assert_eq!(get_option("wait", &OptionValue::Absent), "");
        assert_eq!(
            get_option("name", &OptionValue::String("x".to_string())),
            "--name \"x\" "
        );
        assert_eq!(
            get_option(
                "set",
                &OptionValue::Sequence(vec!["a=1".to_string(), "b=2".to_string()])
            ),
            "--set \"a=1\" --set \"b=2\" "
        );
    }

    #[test]
    fn random_name_is_a_uuid() {
        let name = random_name();
        assert_eq!(uuid::Uuid::parse_str(&name).unwrap().to_string(), name);
    }
}
