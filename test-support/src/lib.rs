//! Step-recording test reports.
//!
//! Each test opens a [`TestReport`] through [`test_report!`], records what it
//! set up and did, and asserts through the report so the outcome of every
//! check is kept. When `TEST_REPORT_DIR` is set the report is written there as
//! a plain-text file once the test finishes (including on panic).

use std::fmt::{Debug, Display};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Longest rendering of a value kept in a report line.
const MAX_VALUE_LEN: usize = 800;

/// Open a [`TestReport`] named after the enclosing test function.
///
/// Works for sync and async tests.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn here() {}
        fn name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let path = name_of(here);
        let path = path.strip_suffix("::here").unwrap_or(path);
        let path = path.strip_suffix("::{{closure}}").unwrap_or(path);
        $crate::TestReport::new(path, $title, file!(), line!())
    }};
}

#[derive(Debug)]
enum Entry {
    Setup(String),
    Action(String),
    Output { label: String, text: String },
    Check { passed: bool, message: String },
}

impl Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entry::Setup(msg) => write!(f, "STEP setup: {}", msg),
            Entry::Action(msg) => write!(f, "STEP action: {}", msg),
            Entry::Output { label, text } => write!(f, "STEP output {}: {:?}", label, text),
            Entry::Check { passed: true, message } => write!(f, "STEP assert_pass: {}", message),
            Entry::Check { passed: false, message } => write!(f, "STEP assert_fail: {}", message),
        }
    }
}

/// Recorder for one test; see the crate docs.
pub struct TestReport {
    path: String,
    title: String,
    location: String,
    report_dir: Option<PathBuf>,
    entries: Mutex<Vec<Entry>>,
    skipped: Mutex<Option<String>>,
}

impl TestReport {
    pub fn new(path: &str, title: &str, file: &str, line: u32) -> Self {
        Self {
            path: path.to_string(),
            title: title.to_string(),
            location: format!("{}:{}", file, line),
            report_dir: std::env::var_os("TEST_REPORT_DIR").map(PathBuf::from),
            entries: Mutex::new(Vec::new()),
            skipped: Mutex::new(None),
        }
    }

    fn push(&self, entry: Entry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn render<T: Debug + ?Sized>(value: &T) -> String {
        let text = format!("{:?}", value);
        if text.len() <= MAX_VALUE_LEN {
            return format!("`{}`", text);
        }
        let mut cut = MAX_VALUE_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("`{}…` ({} bytes)", &text[..cut], text.len())
    }

    /// Mark the test as skipped; call before returning early.
    pub fn skip(&self, reason: impl Display) {
        *self.skipped.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }

    pub fn setup(&self, msg: impl Display) {
        self.push(Entry::Setup(msg.to_string()));
    }

    pub fn action(&self, msg: impl Display) {
        self.push(Entry::Action(msg.to_string()));
    }

    pub fn output(&self, label: &str, text: &str) {
        self.push(Entry::Output {
            label: label.to_string(),
            text: text.to_string(),
        });
    }

    fn check(&self, passed: bool, message: String) {
        self.push(Entry::Check { passed, message });
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug + ?Sized,
        E: Debug + ?Sized,
    {
        let passed = actual == expected;
        self.check(
            passed,
            format!("{}: {} == {}", label, Self::render(actual), Self::render(expected)),
        );
        assert!(
            passed,
            "{}: expected {:?}, got {:?}",
            label, expected, actual
        );
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let passed = haystack.contains(needle);
        self.check(
            passed,
            format!("{}: {} contains {}", label, Self::render(haystack), Self::render(needle)),
        );
        assert!(passed, "{}: {:?} does not contain {:?}", label, haystack, needle);
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.check(value, format!("{}: `{}`", label, value));
        assert!(value, "{}", label);
    }

    /// Assert that `result` is an error whose message contains `needle`.
    pub fn assert_err<T: Debug, E: Display>(&self, label: &str, result: &Result<T, E>, needle: &str) {
        let (passed, shown) = match result {
            Ok(value) => (false, format!("Ok({:?})", value)),
            Err(e) => {
                let msg = e.to_string();
                (msg.contains(needle), msg)
            }
        };
        self.check(
            passed,
            format!("{}: {} is an error containing {}", label, Self::render(&shown), Self::render(needle)),
        );
        assert!(passed, "{}: {} is not an error containing {:?}", label, shown, needle);
    }

    fn write(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };

        let outcome = match &*self.skipped.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(reason) => format!("skip: {}", reason),
            None if std::thread::panicking() => "fail".to_string(),
            None => "pass".to_string(),
        };

        let mut segments = self.path.rsplit("::");
        let name = segments.next().unwrap_or(&self.path);
        let group = segments.next().unwrap_or(&self.path);

        let mut out = vec![
            format!("GROUP: {}", group),
            format!("NAME: {}", name),
            format!("TITLE: {}", self.title),
            format!("SOURCE: {}", self.location),
        ];
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        out.extend(entries.iter().map(ToString::to_string));
        out.push(format!("RESULT: {}", outcome));
        out.push(String::new());

        let file = dir.join(format!("{}.txt", self.path.replace("::", "__")));
        let _ = std::fs::create_dir_all(dir);
        let _ = std::fs::write(file, out.join("\n"));
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write();
    }
}
