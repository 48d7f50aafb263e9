//! Incremental XML stream reader.
//!
//! An XMPP stream is one long document: `<stream:stream>` opens it, each
//! depth-1 element is a stanza, `</stream:stream>` closes it. The reader runs
//! in its own task and forwards complete stanzas over a channel, so the
//! session loop can `select!` on it without losing partial parses.

use log::{debug, trace};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;

use crate::xml::{Element, XmlError};

pub const STREAM_NS: &str = "http://etherx.jabber.org/streams";
pub const CLIENT_NS: &str = "jabber:client";
pub const STREAM_ROOT: &str = "stream:stream";
pub const STREAM_CLOSE: &str = "</stream:stream>";

#[derive(Debug)]
pub enum StreamEvent {
    /// The peer opened its stream.
    Header { id: Option<String>, from: Option<String> },
    /// One complete top-level element.
    Stanza(Element),
    /// Clean close or EOF.
    End,
    Error(XmlError),
}

/// Opening tag sent by the client. No `version` attribute: the stream uses
/// pre-1.0 semantics, which servers pair with iq-based authentication.
pub fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' xmlns='{}' xmlns:stream='{}'>",
        quick_xml::escape::escape(domain),
        CLIENT_NS,
        STREAM_NS
    )
}

/// Read events from `source` until the stream ends, forwarding them to `tx`.
pub async fn read_stream<R>(source: R, tx: mpsc::Sender<StreamEvent>)
where
    R: AsyncBufRead + Unpin,
{
    let mut reader = Reader::from_reader(source);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();

    loop {
        buf.clear();
        let event = match reader.read_event_into_async(&mut buf).await {
            Ok(event) => event,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(e.into())).await;
                return;
            }
        };

        let outgoing = match event {
            Event::Start(start) => match Element::from_start(&start) {
                Ok(el) if stack.is_empty() && el.name == STREAM_ROOT => Some(StreamEvent::Header {
                    id: el.get_attr("id").map(String::from),
                    from: el.get_attr("from").map(String::from),
                }),
                Ok(el) => {
                    stack.push(el);
                    None
                }
                Err(e) => Some(StreamEvent::Error(e)),
            },
            Event::Empty(start) => match Element::from_start(&start) {
                Ok(el) => attach(&mut stack, el),
                Err(e) => Some(StreamEvent::Error(e)),
            },
            Event::End(_) => match stack.pop() {
                Some(el) => attach(&mut stack, el),
                None => Some(StreamEvent::End),
            },
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    match text.unescape() {
                        Ok(text) => top.push_text(text.into_owned()),
                        Err(e) => {
                            let _ = tx.send(StreamEvent::Error(e.into())).await;
                            return;
                        }
                    }
                }
                None
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.push_text(String::from_utf8_lossy(&data.into_inner()).into_owned());
                }
                None
            }
            Event::Eof => Some(StreamEvent::End),
            other => {
                trace!("Ignoring stream event {:?}", other);
                None
            }
        };

        if let Some(outgoing) = outgoing {
            let done = matches!(outgoing, StreamEvent::End | StreamEvent::Error(_));
            if tx.send(outgoing).await.is_err() {
                debug!("Stream consumer went away");
                return;
            }
            if done {
                return;
            }
        }
    }
}

/// Attach a finished element to its parent, or emit it as a stanza.
fn attach(stack: &mut [Element], el: Element) -> Option<StreamEvent> {
    match stack.last_mut() {
        Some(parent) => {
            parent.push_child(el);
            None
        }
        None => Some(StreamEvent::Stanza(el)),
    }
}
