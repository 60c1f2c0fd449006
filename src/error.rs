use std::fmt;

/// One frame of a runtime back-trace, innermost first.
#[derive(Debug)]
pub struct TraceFrame {
    pub line: u32,
    /// `None` for the top-level script.
    pub name: Option<String>,
}

#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            match &frame.name {
                Some(name) => writeln!(f, "[line {}] in {}()", frame.line, name)?,
                None => writeln!(f, "[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum InterpretError {
    /// Rendered diagnostics, one per parse error, in source order.
    Compile(Vec<String>),
    Runtime(RuntimeError),
}

impl InterpretError {
    pub fn exit_code(&self) -> i32 {
        match self {
            InterpretError::Compile(_) => 65,
            InterpretError::Runtime(_) => 70,
        }
    }
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(diags) => {
                for d in diags {
                    writeln!(f, "{}", d)?;
                }
                Ok(())
            }
            InterpretError::Runtime(e) => write!(f, "{}", e),
        }
    }
}
