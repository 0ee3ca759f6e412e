use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Assignment to something other than a variable, indexer or field
    #[error("compile error: invalid assignment to {target} on line {line}{}", hint_line(.hint))]
    InvalidAssignment {
        target: &'static str,
        line: u32,
        hint: Option<String>,
    },

    /// A jump offset that does not fit in 16 bits
    #[error("compile error: jump of {distance} bytes in '{page}' is too far{}", hint_line(.hint))]
    JumpTooFar {
        distance: usize,
        page: String,
        hint: Option<String>,
    },

    #[error("compile error: too many constants ({count}) in one page{}", hint_line(.hint))]
    TooManyConstants { count: usize, hint: Option<String> },

    #[error("compile error: too many {what} ({count}, at most {max}){}", hint_line(.hint))]
    TooManyOperands {
        what: &'static str,
        count: usize,
        max: usize,
        hint: Option<String>,
    },

    /// `break`/`continue`/`return` outside of where they make sense
    #[error("compile error: '{keyword}' {reason}")]
    InvalidPosition {
        keyword: &'static str,
        reason: &'static str,
    },

    /// Internal compiler error (analysis should have excluded it)
    #[error("compile error: internal error: {0}")]
    Internal(String),
}

fn hint_line(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

impl CompileError {
    pub fn invalid_assignment(target: &'static str, line: u32) -> Self {
        CompileError::InvalidAssignment {
            target,
            line,
            hint: Some(
                "only variables, indexers and field accesses can be assigned to".to_string(),
            ),
        }
    }

    pub fn jump_too_far(distance: usize, page: &str) -> Self {
        CompileError::JumpTooFar {
            distance,
            page: page.to_string(),
            hint: Some("split the body into smaller functions".to_string()),
        }
    }

    pub fn too_many_constants(count: usize) -> Self {
        CompileError::TooManyConstants {
            count,
            hint: Some("a page can hold at most 65536 constants".to_string()),
        }
    }

    pub fn too_many_operands(what: &'static str, count: usize, max: usize) -> Self {
        CompileError::TooManyOperands {
            what,
            count,
            max,
            hint: None,
        }
    }

    pub fn too_many_locals(count: usize) -> Self {
        CompileError::TooManyOperands {
            what: "local variables",
            count,
            max: usize::from(u8::MAX),
            hint: Some("move part of the body into a separate function".to_string()),
        }
    }

    pub fn outside_loop(keyword: &'static str) -> Self {
        CompileError::InvalidPosition {
            keyword,
            reason: "can only be used inside a loop",
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}
