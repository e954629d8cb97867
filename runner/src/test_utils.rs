//! Scripted in-memory cluster used by the unit tests.

use crate::{
    shell,
    transport::{Endpoint, RunOutput, Transport, TransportError},
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Execute { endpoint: Endpoint, command: String },
    Upload { endpoint: Endpoint, remote: String },
    Download { endpoint: Endpoint, remote: String },
}

#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// what a scripted handler gets to see
pub struct Request<'a> {
    pub host: &'a str,
    pub user: &'a str,
    pub command: &'a str,
}

type Handler = Box<dyn Fn(&Request) -> Reply + Send + Sync>;

#[derive(Default)]
struct Inner {
    calls: Mutex<Vec<Call>>,
    // later entries win
    handlers: Mutex<Vec<(String, Arc<Handler>)>>,
    files: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    // host -> number of failing attempts left
    down: Mutex<BTreeMap<String, usize>>,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct FakeTransport(Arc<Inner>);

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FakeTransport")
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport(self.inner.clone()))
    }

    pub fn ok(stdout: impl Into<String>) -> Reply {
        Reply {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn exit(status: i32, stdout: &str, stderr: &str) -> Reply {
        Reply {
            status,
            stdout: stdout.to_owned(),
            stderr: stderr.to_owned(),
        }
    }

    /// answer every command containing `pattern` with `handler`
    pub fn respond<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .push((pattern.to_owned(), Arc::new(Box::new(handler))));
    }

    pub fn set_down(&self, host: &str) {
        self.inner.down.lock().insert(host.to_owned(), usize::MAX);
    }

    /// refuse the next `attempts` commands sent to `host`
    pub fn down_for(&self, host: &str, attempts: usize) {
        self.inner.down.lock().insert(host.to_owned(), attempts);
    }

    pub fn put_file(&self, host: &str, path: &str, content: &str) {
        self.inner
            .files
            .lock()
            .insert((host.to_owned(), path.to_owned()), content.as_bytes().to_vec());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.inner
            .files
            .lock()
            .get(&(host.to_owned(), path.to_owned()))
            .map(|content| String::from_utf8_lossy(content).into_owned())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().clone()
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Execute { endpoint, command } if endpoint.host == host => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn uploads_to(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Upload { endpoint, remote } if endpoint.host == host => Some(remote),
                _ => None,
            })
            .collect()
    }

    pub fn count_commands(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Execute { command, .. } if command.contains(pattern)))
            .count()
    }
}

impl Inner {
    fn check_up(&self, host: &str) -> Result<(), TransportError> {
        let mut down = self.down.lock();

        match down.get_mut(host) {
            Some(0) | None => Ok(()),
            Some(left) => {
                if *left != usize::MAX {
                    *left -= 1;
                }

                Err(TransportError::Unreachable {
                    host: host.to_owned(),
                    message: "Connection refused".to_owned(),
                })
            }
        }
    }

    fn read(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(&(host.to_owned(), path.to_owned())).cloned()
    }

    fn write(&self, host: &str, path: &str, content: &[u8]) {
        self.files
            .lock()
            .insert((host.to_owned(), path.to_owned()), content.to_vec());
    }

    /// minimal interpretation of the pipelines the crate emits
    fn interpret(&self, host: &str, command: &str) -> Reply {
        let mut words = split_words(command);
        let mut directory = String::new();

        if words.len() > 3 && words[0] == "cd" && words[2] == "&&" {
            directory = words[1].clone();
            words.drain(..3);
        }

        let discard = words.ends_with(&[">".to_owned(), "/dev/null".to_owned(), "2>&1".to_owned()]);
        if discard {
            words.truncate(words.len() - 3);
        }

        let stages: Vec<&[String]> = words.split(|word| word == "|").collect();
        let mut piped: Option<Vec<u8>> = None;

        for stage in stages {
            match stage.first().map(String::as_str) {
                Some("hostname") => piped = Some(format!("{host}\n").into_bytes()),
                Some("printf") if stage.len() == 3 => piped = Some(stage[2].clone().into_bytes()),
                Some("cat") if stage.len() == 2 => {
                    match self.read(host, &shell::join(&directory, &stage[1])) {
                        Some(content) => piped = Some(content),
                        None => {
                            return FakeCluster::exit(1, "", &format!("cat: {}: No such file or directory", stage[1]))
                        }
                    }
                }
                Some("tee") => {
                    let content = piped.clone().unwrap_or_default();
                    for target in &stage[1..] {
                        self.write(host, &shell::join(&directory, target), &content);
                    }
                }
                _ => piped = Some(Vec::new()),
            }
        }

        if discard {
            FakeCluster::ok("")
        } else {
            FakeCluster::ok(String::from_utf8_lossy(&piped.unwrap_or_default()).into_owned())
        }
    }
}

/// split a command line into words, honouring single quotes and backslashes
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    current.push(c);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }

    words
}

impl Transport for FakeTransport {
    fn execute(
        &self,
        endpoint: &Endpoint,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<RunOutput, TransportError> {
        self.0.calls.lock().push(Call::Execute {
            endpoint: endpoint.clone(),
            command: command.to_owned(),
        });
        self.0.check_up(&endpoint.host)?;

        let handler = self
            .0
            .handlers
            .lock()
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, handler)| handler.clone());

        let reply = match handler {
            Some(handler) => handler(&Request {
                host: &endpoint.host,
                user: &endpoint.user,
                command,
            }),
            None => self.0.interpret(&endpoint.host, command),
        };

        Ok(RunOutput {
            host: endpoint.host.clone(),
            runtime: Duration::from_millis(1),
            stdout: reply.stdout,
            stderr: reply.stderr,
            status: reply.status,
        })
    }

    fn upload(&self, endpoint: &Endpoint, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.0.calls.lock().push(Call::Upload {
            endpoint: endpoint.clone(),
            remote: remote.to_owned(),
        });
        self.0.check_up(&endpoint.host)?;

        let content = fs::read(local).map_err(|source| TransportError::Io {
            host: endpoint.host.clone(),
            source,
        })?;
        self.0.write(&endpoint.host, remote, &content);

        Ok(())
    }

    fn download(&self, endpoint: &Endpoint, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.0.calls.lock().push(Call::Download {
            endpoint: endpoint.clone(),
            remote: remote.to_owned(),
        });
        self.0.check_up(&endpoint.host)?;

        match self.0.read(&endpoint.host, remote) {
            Some(content) => fs::write(local, content).map_err(|source| TransportError::Io {
                host: endpoint.host.clone(),
                source,
            }),
            None => Err(TransportError::Copy {
                host: endpoint.host.clone(),
                path: PathBuf::from(local),
                message: format!("{remote}: No such file or directory"),
            }),
        }
    }
}

#[test]
fn split_words_handles_escaped_quotes() {
    assert_eq!(
        split_words("printf %s 'it'\\''s | here' | tee /tmp/a"),
        ["printf", "%s", "it's | here", "|", "tee", "/tmp/a"]
    );
}
