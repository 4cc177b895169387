// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Service registry and inbound-request dispatch (spec §4.5). Grounded on
//! `original_source/src/LocalHandler.cpp`.

use crate::base_packet::BasePacket;
use crate::channel::RequestHandler;
use crate::error::RpcError;
use crate::service::{MethodDescriptor, Service, ServiceId};
use crate::sink::ChannelSink;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Routes inbound requests to whichever registered [`Service`] matches the
/// packet's `service_id`. Services are held weakly; dropping the last
/// strong owner removes a service from dispatch without an explicit
/// `remove_service` call.
pub struct LocalHandler {
    services: Mutex<Vec<Weak<dyn Service>>>,
}

impl LocalHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalHandler {
            services: Mutex::new(Vec::new()),
        })
    }

    pub fn provide_service(&self, service: &Arc<dyn Service>) {
        self.services.lock().push(Arc::downgrade(service));
    }

    pub fn remove_service(&self, service: &Arc<dyn Service>) {
        let target = Arc::as_ptr(service);
        self.services.lock().retain(|weak| match weak.upgrade() {
            Some(existing) => !Arc::ptr_eq(&existing, service) && !std::ptr::eq(Arc::as_ptr(&existing), target),
            None => false, // lazily prune dead entries while we're here
        });
    }

    pub fn has_service(&self, id: ServiceId) -> bool {
        self.services
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .any(|s| s.id() == id)
    }

    fn matching_services(&self, id: ServiceId) -> Vec<Arc<dyn Service>> {
        self.services
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| s.id() == id)
            .collect()
    }
}

impl RequestHandler for LocalHandler {
    fn handle_request(&self, base: &BasePacket, stream: &Bytes, sink: &Arc<ChannelSink>) -> Result<bool, RpcError> {
        let services = self.matching_services(base.service_id);
        if services.is_empty() {
            return Err(RpcError::Dispatch(format!(
                "service is not supported: service_id={}",
                base.service_id
            )));
        }

        let descriptor = services[0].descriptor();
        let method_desc = *descriptor.method(base.method_index).ok_or_else(|| {
            RpcError::Dispatch(format!(
                "no such method index {} on service {}",
                base.method_index, descriptor.name
            ))
        })?;

        let mut request = services[0].create_request(&method_desc);
        let mut buf = stream.clone();
        let payload = crate::base_packet::read_length_prefixed(&mut buf)?.unwrap_or_default();
        request.decode_into(&payload)?;
        if !buf.is_empty() {
            request.set_stream(buf);
        }

        request.set_caller(base.caller_id.clone());
        request.set_response_required(base.packet_id != 0);
        request.set_method(method_desc);
        request.set_channel(Arc::downgrade(sink));

        let mut response = services[0].create_response(&method_desc);
        response.bind(base.to_response(), method_desc, descriptor, Arc::downgrade(sink));

        tracing::trace!(target: "rpc", method = method_desc.name, "handling request by local handler");

        for service in &services {
            if let Err(e) = service.call_method(&method_desc, request.as_ref(), response.as_mut()) {
                response.set_exception(e);
            }
        }

        response.send();

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_packet::Direction;
    use crate::message::BincodeMessage;
    use crate::schema_message;
    use crate::service::{Request as Req, RequestEnvelope, Response as Resp, ResponseEnvelope, ServiceDescriptor};
    use serde::{Deserialize, Serialize};

    #[derive(Default, Clone, Serialize, Deserialize)]
    struct Ping {
        data: i32,
    }
    schema_message!(Ping, "test.Ping");

    struct PingService;

    const METHOD: MethodDescriptor = MethodDescriptor { index: 0, name: "Ping.Increment" };
    static METHODS: &[MethodDescriptor] = &[METHOD];
    const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor { id: 42, name: "Ping", methods: METHODS };

    impl Service for PingService {
        fn id(&self) -> ServiceId {
            42
        }
        fn name(&self) -> &str {
            "Ping"
        }
        fn descriptor(&self) -> ServiceDescriptor {
            DESCRIPTOR
        }
        fn create_request(&self, _method: &MethodDescriptor) -> Box<dyn RequestEnvelope> {
            Box::new(Req::<Ping>::new(Ping::default()))
        }
        fn create_response(&self, _method: &MethodDescriptor) -> Box<dyn ResponseEnvelope> {
            Box::new(Resp::<Ping>::new())
        }
        fn call_method(
            &self,
            _method: &MethodDescriptor,
            request: &dyn RequestEnvelope,
            response: &mut dyn ResponseEnvelope,
        ) -> Result<(), RpcError> {
            let req = request
                .as_any()
                .downcast_ref::<Req<Ping>>()
                .expect("generated dispatch always matches its own request type");
            let resp = response
                .as_any_mut()
                .downcast_mut::<Resp<Ping>>()
                .expect("generated dispatch always matches its own response type");
            resp.data = req.data + 1;
            Ok(())
        }
    }

    #[test]
    fn no_matching_service_raises_dispatch_error() {
        let handler = LocalHandler::new();
        let sink = ChannelSink::new();
        let base = BasePacket {
            direction: Direction::Request,
            service_id: 7,
            packet_id: 1,
            ..Default::default()
        };
        let err = handler.handle_request(&base, &Bytes::new(), &sink).unwrap_err();
        assert!(matches!(err, RpcError::Dispatch(_)));
    }

    #[test]
    fn has_service_reflects_weak_liveness() {
        let handler = LocalHandler::new();
        let svc: Arc<dyn Service> = Arc::new(PingService);
        handler.provide_service(&svc);
        assert!(handler.has_service(42));
        drop(svc);
        assert!(!handler.has_service(42));
    }
}
