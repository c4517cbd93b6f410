//! Generic command object handed to the executor.

use bytes::Bytes;

/// An ordered list of byte-string arguments (name first) plus the subset of
/// arguments used for routing.
///
/// ```
/// use aikv_cluster_client::Command;
///
/// let cmd = Command::new("SET").key("user:1").arg("alice");
/// assert_eq!(cmd.name(), "SET");
/// assert_eq!(cmd.keys().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
    keys: Vec<Bytes>,
    read_only: bool,
}

impl Command {
    /// A command with no arguments yet.
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
            keys: Vec::new(),
            read_only: false,
        }
    }

    /// Append a plain argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append an argument that is also a routing key.
    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        let key = key.into();
        self.args.push(key.clone());
        self.keys.push(key);
        self
    }

    /// Mark the command as safe to serve from a replica.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Name followed by every argument, as sent.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Arguments that take part in routing.
    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }

    /// Safe to serve from a replica.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Uppercased command name.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|n| String::from_utf8_lossy(n).to_uppercase())
            .unwrap_or_default()
    }
}
