//! Save and delete notifications.
//!
//! Receivers run synchronously, in registration order, inside the operation
//! that sends them. A receiver returning `Err` aborts that operation; when
//! the operation runs in a transaction the transaction is rolled back.

use crate::record::Record;
use splitmodel_core::Result;

/// Which notification a receiver listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    PreSave,
    PostSave,
    PreDelete,
    PostDelete,
}

/// A notification about one record.
///
/// `model` is the model the record was created as, so a proxy keeps its own
/// name here even though it writes its concrete model's tables.
#[derive(Debug)]
pub enum ModelSignal<'a> {
    PreSave {
        model: &'a str,
        record: &'a Record,
        raw: bool,
        update_fields: Option<&'a [String]>,
    },
    PostSave {
        model: &'a str,
        record: &'a Record,
        created: bool,
        raw: bool,
        update_fields: Option<&'a [String]>,
    },
    PreDelete {
        model: &'a str,
        record: &'a Record,
    },
    PostDelete {
        model: &'a str,
        record: &'a Record,
    },
}

impl ModelSignal<'_> {
    pub fn kind(&self) -> SignalKind {
        match self {
            ModelSignal::PreSave { .. } => SignalKind::PreSave,
            ModelSignal::PostSave { .. } => SignalKind::PostSave,
            ModelSignal::PreDelete { .. } => SignalKind::PreDelete,
            ModelSignal::PostDelete { .. } => SignalKind::PostDelete,
        }
    }

    /// The sending model.
    pub fn model(&self) -> &str {
        match self {
            ModelSignal::PreSave { model, .. }
            | ModelSignal::PostSave { model, .. }
            | ModelSignal::PreDelete { model, .. }
            | ModelSignal::PostDelete { model, .. } => model,
        }
    }

    pub fn record(&self) -> &Record {
        match self {
            ModelSignal::PreSave { record, .. }
            | ModelSignal::PostSave { record, .. }
            | ModelSignal::PreDelete { record, .. }
            | ModelSignal::PostDelete { record, .. } => record,
        }
    }
}

type Receiver = Box<dyn Fn(&ModelSignal<'_>) -> Result<()> + Send + Sync>;

struct Registration {
    kind: SignalKind,
    sender: Option<String>,
    receiver: Receiver,
}

/// The receivers connected to a session.
#[derive(Default)]
pub struct Signals {
    receivers: Vec<Registration>,
}

impl std::fmt::Debug for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signals")
            .field("receivers", &self.receivers.len())
            .finish()
    }
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for `kind` from every model.
    pub fn connect<F>(&mut self, kind: SignalKind, receiver: F)
    where
        F: Fn(&ModelSignal<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.receivers.push(Registration {
            kind,
            sender: None,
            receiver: Box::new(receiver),
        });
    }

    /// Listen for `kind` sent by `sender` only.
    pub fn connect_for<F>(&mut self, kind: SignalKind, sender: impl Into<String>, receiver: F)
    where
        F: Fn(&ModelSignal<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.receivers.push(Registration {
            kind,
            sender: Some(sender.into()),
            receiver: Box::new(receiver),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Deliver a signal, stopping at the first receiver that fails.
    pub fn send(&self, signal: &ModelSignal<'_>) -> Result<()> {
        let kind = signal.kind();
        for registration in &self.receivers {
            if registration.kind != kind {
                continue;
            }
            if let Some(sender) = &registration.sender {
                if sender != signal.model() {
                    continue;
                }
            }
            (registration.receiver)(signal)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitmodel_core::{Error, FieldInfo, ModelOptions, Registry, SqlType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn record() -> Record {
        let registry = Registry::builder()
            .model(ModelOptions::new("Tag").field(FieldInfo::new("label", SqlType::Text)))
            .model(ModelOptions::proxy("TagProxy", "Tag"))
            .build()
            .unwrap();
        Record::new(&Arc::new(registry), "TagProxy").unwrap()
    }

    #[test]
    fn receivers_filter_by_kind_and_sender() {
        let record = record();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut signals = Signals::new();
        let log = Arc::clone(&seen);
        signals.connect(SignalKind::PostSave, move |s| {
            log.lock().unwrap().push(format!("any:{}", s.model()));
            Ok(())
        });
        let log = Arc::clone(&seen);
        signals.connect_for(SignalKind::PostSave, "Tag", move |s| {
            log.lock().unwrap().push(format!("tag:{}", s.model()));
            Ok(())
        });

        signals
            .send(&ModelSignal::PostSave {
                model: "TagProxy",
                record: &record,
                created: true,
                raw: false,
                update_fields: None,
            })
            .unwrap();
        signals
            .send(&ModelSignal::PreSave {
                model: "TagProxy",
                record: &record,
                raw: false,
                update_fields: None,
            })
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["any:TagProxy".to_string()]);
    }

    #[test]
    fn failing_receiver_stops_delivery() {
        let record = record();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut signals = Signals::new();
        signals.connect(SignalKind::PreDelete, |_| Err(Error::Custom("vetoed".into())));
        let counter = Arc::clone(&calls);
        signals.connect(SignalKind::PreDelete, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = signals
            .send(&ModelSignal::PreDelete {
                model: "Tag",
                record: &record,
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "vetoed");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
