//! Empty-fragment request handler (spec.md §4.5.7): a link configured this
//! way never consults its latency buffer, it always answers with a
//! zero-length, `DATA_NOT_FOUND` fragment. Grounded on
//! `EmptyFragmentRequestHandlerModel`, which overrides only `issue_request`
//! on top of the default model.

use std::sync::Arc;
use std::time::Duration;

use crate::issues::{ComponentId, ReadoutWarning};
use crate::transport::{error_bits, DataRequest, Fragment, FragmentSender};

/// Always answers with an empty fragment; never touches a latency buffer,
/// never waits, never records. Used for links whose data is not wanted on
/// this run (spec.md §4.5.7).
pub struct EmptyFragmentRequestHandler {
    component: ComponentId,
    fragment_sender: Arc<dyn FragmentSender>,
}

impl EmptyFragmentRequestHandler {
    pub fn new(component: ComponentId, fragment_sender: Arc<dyn FragmentSender>) -> Self {
        Self { component, fragment_sender }
    }

    /// Answers `dr` immediately with an empty, `DATA_NOT_FOUND` fragment.
    pub fn issue_request(&self, dr: DataRequest) {
        let fragment = Fragment {
            component: dr.component,
            trigger_number: dr.trigger_number,
            sequence_number: dr.sequence_number,
            run_number: dr.run_number,
            window_begin: dr.window_begin,
            window_end: dr.window_end,
            error_bits: error_bits::DATA_NOT_FOUND,
            body: Vec::new(),
        };
        if !self.fragment_sender.send(&dr.data_destination, fragment, Duration::from_millis(10)) {
            ReadoutWarning::CannotWriteToQueue {
                component: self.component,
                queue: dr.data_destination,
            }
            .log();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelFragmentSender;
    use std::collections::HashMap;

    #[test]
    fn always_answers_empty_and_not_found() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut destinations = HashMap::new();
        destinations.insert("dest".to_string(), tx);
        let sender = Arc::new(ChannelFragmentSender::new(destinations));
        let handler = EmptyFragmentRequestHandler::new(7, sender);

        handler.issue_request(DataRequest {
            component: 7,
            trigger_number: 1,
            sequence_number: 0,
            run_number: 1,
            window_begin: 100,
            window_end: 200,
            allow_partial: false,
            data_destination: "dest".to_string(),
        });

        let fragment = rx.try_recv().unwrap();
        assert!(fragment.is_empty_of_data());
        assert_eq!(fragment.error_bits & error_bits::DATA_NOT_FOUND, error_bits::DATA_NOT_FOUND);
    }
}
