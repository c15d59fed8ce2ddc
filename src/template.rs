//! Command-line template rendering.
//!
//! Templates hold `{key}` placeholders resolved against a flat string
//! record. `{key!r}` shell-quotes the value; `{key!t}` treats the value as
//! a path to a template file and substitutes a freshly written, itself
//! rendered copy of that file. Rendering happens in two passes: group
//! expansion uses [`Renderer::deferred`], which resolves `{key}` and
//! `{key!r}` but copies template-file conversions and brace escapes
//! through untouched, and job creation later runs
//! [`Renderer::materialize`], which writes the instance files and
//! unescapes `{{`/`}}`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::TemplateError;
use crate::quote::quote_for_shell;

/// Output of a materializing render.
#[derive(Debug, Default)]
pub struct Rendered {
    /// The fully substituted command line.
    pub text: String,
    /// Instance files written for `!t` conversions, keyed by the instance
    /// path with the original template path as value. Callers delete the
    /// keys once the owning job is discarded (see
    /// [`discard_instance_files`]).
    pub instance_files: HashMap<PathBuf, PathBuf>,
}

/// How deep the current render pass sits.
#[derive(Clone, Copy, PartialEq)]
enum Pass {
    /// First pass over a command template: leave `!t` and escapes alone.
    Deferred,
    /// Final pass over a command template: everything resolves.
    Full,
    /// Rendering the contents of a template file; nested `!t` is invalid.
    TemplateFile,
}

/// Renders templates against one record.
pub struct Renderer<'a> {
    record: &'a HashMap<String, String>,
    instance_dir: PathBuf,
}

impl<'a> Renderer<'a> {
    /// Create a renderer over `record`. Instance files for `!t`
    /// conversions are written to the current directory unless
    /// [`Renderer::with_instance_dir`] overrides it.
    pub fn new(record: &'a HashMap<String, String>) -> Self {
        Self {
            record,
            instance_dir: PathBuf::from("."),
        }
    }

    /// Set the directory instance files are written to.
    pub fn with_instance_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.instance_dir = dir.into();
        self
    }

    /// Render `{key}` and `{key!r}` placeholders, keeping `{key!t}` and
    /// brace escapes syntactically intact for a later materializing pass.
    pub fn deferred(&self, template: &str) -> Result<String, TemplateError> {
        let mut files = HashMap::new();
        self.render_pass(template, Pass::Deferred, &mut files)
    }

    /// Render every placeholder, writing an instance file for each `!t`
    /// conversion and substituting its quoted path. A failed render
    /// deletes the instance files it already wrote.
    pub fn materialize(&self, template: &str) -> Result<Rendered, TemplateError> {
        let mut files = HashMap::new();
        match self.render_pass(template, Pass::Full, &mut files) {
            Ok(text) => Ok(Rendered {
                text,
                instance_files: files,
            }),
            Err(e) => {
                discard_instance_files(&files);
                Err(e)
            }
        }
    }

    fn render_pass(
        &self,
        template: &str,
        pass: Pass,
        files: &mut HashMap<PathBuf, PathBuf>,
    ) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    if pass == Pass::Deferred {
                        out.push_str("{{");
                    } else {
                        out.push('{');
                    }
                }
                '{' => {
                    let (name, conversion) = parse_placeholder(&mut chars)?;
                    self.substitute(&name, conversion, pass, files, &mut out)?;
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    if pass == Pass::Deferred {
                        out.push_str("}}");
                    } else {
                        out.push('}');
                    }
                }
                '}' => {
                    return Err(TemplateError::Syntax(
                        "single '}' outside a placeholder".into(),
                    ));
                }
                _ => out.push(ch),
            }
        }

        Ok(out)
    }

    fn substitute(
        &self,
        name: &str,
        conversion: Option<char>,
        pass: Pass,
        files: &mut HashMap<PathBuf, PathBuf>,
        out: &mut String,
    ) -> Result<(), TemplateError> {
        match conversion {
            None => out.push_str(self.lookup(name)?),
            Some('r') => out.push_str(&quote_for_shell(self.lookup(name)?)),
            Some('t') => match pass {
                Pass::Deferred => {
                    out.push('{');
                    out.push_str(name);
                    out.push_str("!t}");
                }
                Pass::Full => {
                    let original = PathBuf::from(self.lookup(name)?);
                    let instance = self.write_instance_file(&original, files)?;
                    out.push_str(&quote_for_shell(&instance.to_string_lossy()));
                }
                Pass::TemplateFile => {
                    return Err(TemplateError::Syntax(format!(
                        "template-file conversion {name:?} inside a template file"
                    )));
                }
            },
            Some(other) => return Err(TemplateError::UnknownConversion { conversion: other }),
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<&str, TemplateError> {
        self.record
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| TemplateError::UnresolvedKey {
                key: name.to_string(),
            })
    }

    /// Write a rendered copy of `original` next to the running job and
    /// record the instance → original mapping.
    fn write_instance_file(
        &self,
        original: &Path,
        files: &mut HashMap<PathBuf, PathBuf>,
    ) -> Result<PathBuf, TemplateError> {
        let content = fs::read_to_string(original).map_err(|e| TemplateError::TemplateFile {
            path: original.to_path_buf(),
            source: e,
        })?;
        let rendered = self.render_pass(&content, Pass::TemplateFile, files)?;

        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "template".into());
        let suffix = original
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{stem}."))
            .suffix(&suffix)
            .tempfile_in(&self.instance_dir)
            .map_err(|e| TemplateError::InstanceFile {
                path: self.instance_dir.clone(),
                source: e,
            })?;
        tmp.write_all(rendered.as_bytes())
            .map_err(|e| TemplateError::InstanceFile {
                path: tmp.path().to_path_buf(),
                source: e,
            })?;
        let (_, path) = tmp.keep().map_err(|e| TemplateError::InstanceFile {
            path: e.file.path().to_path_buf(),
            source: e.error,
        })?;

        debug!(
            template = %original.display(),
            instance = %path.display(),
            "wrote instance file"
        );
        files.insert(path.clone(), original.to_path_buf());
        Ok(path)
    }
}

/// Delete written instance files, warning about any that cannot be
/// removed. Files already gone are skipped.
pub fn discard_instance_files(files: &HashMap<PathBuf, PathBuf>) {
    for instance in files.keys() {
        if instance.is_file() {
            if let Err(e) = fs::remove_file(instance) {
                warn!(file = %instance.display(), error = %e, "failed to remove instance file");
            }
        }
    }
}

/// Parse the remainder of a placeholder after its opening `{`.
fn parse_placeholder(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Result<(String, Option<char>), TemplateError> {
    let mut name = String::new();
    loop {
        match chars.next() {
            Some('}') => {
                if name.is_empty() {
                    return Err(TemplateError::Syntax("empty placeholder name".into()));
                }
                return Ok((name, None));
            }
            Some('!') => {
                let conversion = chars.next().ok_or_else(|| {
                    TemplateError::Syntax(format!("unterminated placeholder {name:?}"))
                })?;
                return match chars.next() {
                    Some('}') => Ok((name, Some(conversion))),
                    _ => Err(TemplateError::Syntax(format!(
                        "expected '}}' after conversion in placeholder {name:?}"
                    ))),
                };
            }
            Some('{') => {
                return Err(TemplateError::Syntax(
                    "'{' inside a placeholder".into(),
                ));
            }
            Some(c) => name.push(c),
            None => {
                return Err(TemplateError::Syntax(format!(
                    "unterminated placeholder {name:?}"
                )));
            }
        }
    }
}
