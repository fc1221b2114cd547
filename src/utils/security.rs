use thiserror::Error;

/// Longest file name accepted from a peer, in bytes
pub const MAX_FILENAME_LEN: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("File name is empty")]
    Empty,

    #[error("File name contains null byte")]
    NullByte,

    #[error("File name contains control character")]
    ControlCharacter,

    #[error("File name contains directory separator")]
    ContainsDirectorySeparator,

    #[error("File name refers to a directory (. or ..)")]
    DotName,

    #[error("File name longer than {MAX_FILENAME_LEN} bytes")]
    TooLong,
}

//===============
// Name Handling
//===============

/// Validate a file name offered by a peer before surfacing it.
/// A valid name is a single path component: no separators, no `.`/`..`,
/// no NUL or other control characters.
pub fn validate_filename(filename: &str) -> Result<(), ValidationError> {
    if filename.is_empty() {
        return Err(ValidationError::Empty);
    }

    // rust uses C-style APIs so \0 can end str early
    if filename.contains('\0') {
        return Err(ValidationError::NullByte);
    }

    if filename.chars().any(char::is_control) {
        return Err(ValidationError::ControlCharacter);
    }

    // checked on both platforms, the name may be saved on either
    if filename.contains('/') || filename.contains('\\') {
        return Err(ValidationError::ContainsDirectorySeparator);
    }

    if filename == "." || filename == ".." {
        return Err(ValidationError::DotName);
    }

    if filename.len() > MAX_FILENAME_LEN {
        return Err(ValidationError::TooLong);
    }

    Ok(())
}
