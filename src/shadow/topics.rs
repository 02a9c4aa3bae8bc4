//! Shadow topic names and inbound routing.

/// What the synchronizer should do with a message on a given topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The payload may carry a full "desired" state.
    DesiredState,
    /// The service rejected a shadow request.
    Rejected,
    /// Not a topic the synchronizer acts on.
    Ignored,
}

/// Every shadow topic of one thing.
///
/// Names are `<root>/<thing>/shadow/<suffix>` when a root such as
/// `$aws/things` is configured, and `<thing>/shadow/<suffix>` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowTopics {
    pub get: String,
    pub get_accepted: String,
    pub get_rejected: String,
    pub update: String,
    pub update_accepted: String,
    pub update_delta: String,
    pub update_documents: String,
}

impl ShadowTopics {
    pub fn new(thing_name: &str) -> Self {
        Self::with_root(None, thing_name)
    }

    pub fn with_root(root: Option<&str>, thing_name: &str) -> Self {
        let base = match root {
            Some(root) => format!("{}/{thing_name}/shadow", root.trim_end_matches('/')),
            None => format!("{thing_name}/shadow"),
        };
        Self {
            get: format!("{base}/get"),
            get_accepted: format!("{base}/get/accepted"),
            get_rejected: format!("{base}/get/rejected"),
            update: format!("{base}/update"),
            update_accepted: format!("{base}/update/accepted"),
            update_delta: format!("{base}/update/delta"),
            update_documents: format!("{base}/update/documents"),
        }
    }

    /// Topics subscribed after every successful connect: everything except
    /// `update`, which the device only publishes to.
    pub fn subscriptions(&self, include_documents: bool) -> Vec<&str> {
        let mut topics = vec![
            self.get.as_str(),
            self.get_accepted.as_str(),
            self.get_rejected.as_str(),
            self.update_accepted.as_str(),
            self.update_delta.as_str(),
        ];
        if include_documents {
            topics.push(self.update_documents.as_str());
        }
        topics
    }

    /// Exact, case-sensitive match of an inbound topic.
    ///
    /// `update/accepted` is routed like `get/accepted`: the service echoes
    /// operator changes there with a "desired" section.
    pub fn route(&self, topic: &str) -> Route {
        if topic == self.get_accepted || topic == self.update_accepted {
            Route::DesiredState
        } else if topic == self.get_rejected {
            Route::Rejected
        } else {
            Route::Ignored
        }
    }
}
