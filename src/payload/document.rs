//! Named payload items carried by a routing-slip message
//!
//! A [`Document`] stores its data in wire form: unencoded JSON-safe text, or
//! base64 for binary content. The [`Document::reader`] and
//! [`Document::writer`] views apply the encoding transparently; the public
//! `data` field always exposes the raw, possibly-encoded string.

use base64::engine::general_purpose::{GeneralPurpose, STANDARD};
use base64::read::DecoderReader;
use base64::write::EncoderWriter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Read, Write};

/// Set of documents keyed by name. Keys are unique, order carries no meaning.
pub type Documents = HashMap<String, Document>;

/// Supported document data encodings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Unencoded data, must be JSON-serializable text.
    #[default]
    #[serde(rename = "")]
    None,
    /// Base64 (standard alphabet, padded) for binary content.
    #[serde(rename = "base64")]
    Base64,
}

impl Encoding {
    /// True for the default (absent on the wire) encoding.
    pub fn is_none(&self) -> bool {
        matches!(self, Encoding::None)
    }
}

/// A payload item: data, content type, and optional encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content_type: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Encoding::is_none")]
    pub encoding: Encoding,
}

impl Document {
    /// Create a document from data already in its encoded form.
    pub fn new(
        data: impl Into<String>,
        content_type: impl Into<String>,
        encoding: Encoding,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
            encoding,
        }
    }

    /// Start a blank document with the given content type and encoding.
    pub fn empty(content_type: impl Into<String>, encoding: Encoding) -> Self {
        Self::new(String::new(), content_type, encoding)
    }

    /// Create a document by routing raw bytes through the encoding writer.
    pub fn from_bytes(
        bytes: &[u8],
        content_type: impl Into<String>,
        encoding: Encoding,
    ) -> io::Result<Self> {
        let mut document = Self::empty(content_type, encoding);
        let mut writer = document.writer();
        writer.write_all(bytes)?;
        writer.finish()?;
        Ok(document)
    }

    /// Reader over the document data with the encoding applied.
    ///
    /// Use the `data` field directly for verbatim access to the stored form.
    pub fn reader(&self) -> Box<dyn Read + '_> {
        match self.encoding {
            Encoding::None => Box::new(self.data.as_bytes()),
            Encoding::Base64 => Box::new(DecoderReader::new(self.data.as_bytes(), &STANDARD)),
        }
    }

    /// Read the full document data with the encoding applied.
    pub fn decoded(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.reader().read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Writer that appends to the document data, applying the encoding.
    ///
    /// Base64 padding is flushed when the writer is dropped; call
    /// [`DocumentWriter::finish`] to observe encoding errors instead.
    pub fn writer(&mut self) -> DocumentWriter<'_> {
        let sink = TextSink {
            data: &mut self.data,
        };
        DocumentWriter {
            sink: match self.encoding {
                Encoding::None => Sink::Plain(sink),
                Encoding::Base64 => Sink::Base64(EncoderWriter::new(sink, &STANDARD)),
            },
        }
    }
}

/// Encoding-aware append handle returned by [`Document::writer`].
pub struct DocumentWriter<'a> {
    sink: Sink<'a>,
}

enum Sink<'a> {
    Plain(TextSink<'a>),
    Base64(EncoderWriter<'static, GeneralPurpose, TextSink<'a>>),
}

impl DocumentWriter<'_> {
    /// Flush any buffered encoder state and surface the error, if any.
    pub fn finish(self) -> io::Result<()> {
        match self.sink {
            Sink::Plain(_) => Ok(()),
            Sink::Base64(encoder) => encoder.finish().map(|_| ()),
        }
    }
}

impl Write for DocumentWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.sink {
            Sink::Plain(sink) => sink.write(buf),
            Sink::Base64(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Plain(sink) => sink.flush(),
            Sink::Base64(encoder) => encoder.flush(),
        }
    }
}

/// Appends to the backing string. Unencoded writes must be valid UTF-8;
/// binary content belongs in a base64 document.
struct TextSink<'a> {
    data: &'a mut String,
}

impl Write for TextSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = std::str::from_utf8(buf)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.data.push_str(text);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
