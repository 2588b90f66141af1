//! Codec error kinds and the context attached as they propagate.

use core::fmt;

/// Position information attached to a failure as it crosses layers: the
/// dispatch layer knows the template, cursor and field; the reactor adds
/// the byte offset into the source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Wire template id of the message being processed.
    pub template_id: Option<i64>,
    /// Script cursor at the point of failure.
    pub cursor: Option<usize>,
    /// Dictionary instance of the failing field.
    pub field: Option<u32>,
    /// Byte offset into the source stream.
    pub byte_offset: Option<u64>,
}

impl ErrorContext {
    /// Context naming only the failing template.
    pub fn template(template_id: i64) -> Self {
        Self {
            template_id: Some(template_id),
            ..Self::default()
        }
    }

    /// Fill any position fields the lower layer left empty.
    pub fn or(mut self, outer: ErrorContext) -> Self {
        self.template_id = self.template_id.or(outer.template_id);
        self.cursor = self.cursor.or(outer.cursor);
        self.field = self.field.or(outer.field);
        self.byte_offset = self.byte_offset.or(outer.byte_offset);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = self.template_id {
            write!(f, " template={id}")?;
        }
        if let Some(cursor) = self.cursor {
            write!(f, " cursor={cursor}")?;
        }
        if let Some(field) = self.field {
            write!(f, " field={field}")?;
        }
        if let Some(offset) = self.byte_offset {
            write!(f, " byte={offset}")?;
        }
        Ok(())
    }
}

/// The specific protocol rule a malformed stream broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// A stop-bit varint ran past the widest encodable value.
    #[error("stop-bit varint overflow")]
    VarintOverflow,
    /// More presence-map bits were requested than the group's map holds.
    #[error("presence map exhausted")]
    PmapExhausted,
    /// Group nesting exceeded the catalog's computed maximum.
    #[error("presence map stack depth exceeded")]
    PmapDepthExceeded,
    /// A mandatory field carried the null representation.
    #[error("null on a mandatory field")]
    ForbiddenNull,
    /// The stream named a template the catalog does not define.
    #[error("unknown template id")]
    UnknownTemplate,
    /// A variable-length field exceeded its configured bound.
    #[error("variable-length field over configured bound")]
    LengthOutOfBounds,
}

/// Failures while building a catalog from XML or from its binary form.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Malformed template XML.
    #[error("template xml: {0}")]
    Xml(#[from] quick_xml::Error),
    /// A field element is missing a required attribute or carries a bad one.
    #[error("bad attribute on <{element}>: {detail}")]
    BadAttribute {
        /// Element the attribute belongs to.
        element: String,
        /// What was wrong.
        detail: String,
    },
    /// An operator element references an undefined field shape.
    #[error("field `{0}` is not defined by the template")]
    UndefinedField(String),
    /// Two dictionaries share a name with different scopes.
    #[error("dictionary name collision: `{0}`")]
    DictionaryNameCollision(String),
    /// A decimal field is missing its exponent or mantissa subfield.
    #[error("decimal field `{0}` must declare both subfields")]
    DecimalSubfieldMissing(String),
    /// More dictionary instances than the token format can index.
    #[error("dictionary instance index overflow")]
    InstanceOverflow,
    /// The binary image does not start with the catalog magic.
    #[error("bad catalog magic")]
    BadMagic,
    /// The binary image is from an incompatible catalog generation.
    #[error("unsupported catalog version {0}")]
    UnsupportedVersion(u32),
    /// The binary image ends mid-structure.
    #[error("catalog image truncated")]
    Truncated,
    /// A packed token in the binary image fails to validate.
    #[error("catalog image carries an invalid token at {0}")]
    InvalidToken(usize),
}

/// Top-level error of every codec operation. The kinds are exclusive:
/// a failure is exactly one of these.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The byte source was exhausted mid-field.
    #[error("unexpected end of stream{0}")]
    UnexpectedEndOfStream(ErrorContext),
    /// The stream is malformed with respect to the catalog.
    #[error("protocol violation: {violation}{context}")]
    ProtocolViolation {
        /// The rule that was broken.
        violation: Violation,
        /// Where it happened.
        context: ErrorContext,
    },
    /// The catalog itself is unusable.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    /// Ring space was unavailable in non-blocking mode.
    #[error("ring capacity exhausted")]
    RingOverflow,
    /// Cooperative shutdown was requested.
    #[error("shutdown requested")]
    Shutdown,
    /// The underlying byte source or sink failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Attach outer position context without clobbering inner detail.
    pub fn with_context(self, outer: ErrorContext) -> Self {
        match self {
            Self::UnexpectedEndOfStream(inner) => Self::UnexpectedEndOfStream(inner.or(outer)),
            Self::ProtocolViolation { violation, context } => Self::ProtocolViolation {
                violation,
                context: context.or(outer),
            },
            other => other,
        }
    }

    /// Shorthand for a contextless violation; layers add context on the
    /// way up.
    pub fn violation(violation: Violation) -> Self {
        Self::ProtocolViolation {
            violation,
            context: ErrorContext::default(),
        }
    }

    /// Whether this error abandons the stream (everything except ring
    /// overflow and shutdown).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::RingOverflow | Self::Shutdown)
    }
}

impl From<fast_ring::RingError> for CodecError {
    fn from(error: fast_ring::RingError) -> Self {
        match error {
            fast_ring::RingError::Overflow => Self::RingOverflow,
            fast_ring::RingError::Shutdown => Self::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_layers_merge_without_clobbering() {
        let inner = CodecError::violation(Violation::ForbiddenNull)
            .with_context(ErrorContext {
                cursor: Some(12),
                field: Some(7),
                ..ErrorContext::default()
            })
            .with_context(ErrorContext {
                template_id: Some(36),
                cursor: Some(999),
                byte_offset: Some(1024),
                ..ErrorContext::default()
            });
        let CodecError::ProtocolViolation { context, .. } = inner else {
            panic!("kind changed");
        };
        assert_eq!(context.cursor, Some(12));
        assert_eq!(context.field, Some(7));
        assert_eq!(context.template_id, Some(36));
        assert_eq!(context.byte_offset, Some(1024));
    }

    #[test]
    fn diagnostic_line_names_kind_template_field_and_offset() {
        let err = CodecError::violation(Violation::VarintOverflow).with_context(ErrorContext {
            template_id: Some(3),
            cursor: Some(5),
            field: Some(2),
            byte_offset: Some(77),
        });
        let line = err.to_string();
        assert!(line.contains("varint overflow"));
        assert!(line.contains("template=3"));
        assert!(line.contains("field=2"));
        assert!(line.contains("byte=77"));
    }
}
