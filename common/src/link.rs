use serde::{de::DeserializeOwned, Serialize};

use crate::{
    api::{
        DeleteConfirmation, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
        RegisterResponse, SessionReport, UpdateRequest, UpdateResponse,
        DEVICE_DELETE_RESPONSE_PATH, HEARTBEAT_DEVICE_PATH, PAUSE_DEVICE_PATH,
        REGISTER_DEVICE_PATH, STOP_DEVICE_PATH, UPDATE_DEVICE_PATH,
    },
    error::LinkError,
};

/// Calls the device makes against the management server. Every call is
/// bounded by the implementation's request timeout.
pub trait ServerLink {
    fn register(&mut self, request: &RegisterRequest) -> Result<RegisterResponse, LinkError>;
    fn update(&mut self, request: &UpdateRequest) -> Result<UpdateResponse, LinkError>;
    fn heartbeat(&mut self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, LinkError>;
    fn report_pause(&mut self, report: &SessionReport) -> Result<(), LinkError>;
    fn report_stop(&mut self, report: &SessionReport) -> Result<(), LinkError>;
    fn confirm_delete(&mut self, confirmation: &DeleteConfirmation) -> Result<(), LinkError>;
}

/// One JSON POST round trip; returns the response body on a 2xx status.
pub trait JsonTransport {
    fn post(&mut self, path: &str, body: &[u8]) -> Result<Vec<u8>, LinkError>;
}

/// [`ServerLink`] over any [`JsonTransport`].
pub struct HttpLink<T> {
    transport: T,
}

impl<T: JsonTransport> HttpLink<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn call<Req, Resp>(&mut self, path: &str, request: &Req) -> Result<Resp, LinkError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Default,
    {
        let body = serde_json::to_vec(request).map_err(|err| LinkError::Decode(err.to_string()))?;
        let response = self.transport.post(path, &body)?;
        if response.iter().all(u8::is_ascii_whitespace) {
            return Ok(Resp::default());
        }
        serde_json::from_slice(&response).map_err(|err| LinkError::Decode(err.to_string()))
    }

    fn send<Req: Serialize>(&mut self, path: &str, request: &Req) -> Result<(), LinkError> {
        let body = serde_json::to_vec(request).map_err(|err| LinkError::Decode(err.to_string()))?;
        self.transport.post(path, &body).map(|_| ())
    }
}

impl<T: JsonTransport> ServerLink for HttpLink<T> {
    fn register(&mut self, request: &RegisterRequest) -> Result<RegisterResponse, LinkError> {
        let body = serde_json::to_vec(request).map_err(|err| LinkError::Decode(err.to_string()))?;
        let response = self.transport.post(REGISTER_DEVICE_PATH, &body)?;
        serde_json::from_slice(&response).map_err(|err| LinkError::Decode(err.to_string()))
    }

    fn update(&mut self, request: &UpdateRequest) -> Result<UpdateResponse, LinkError> {
        self.call(UPDATE_DEVICE_PATH, request)
    }

    fn heartbeat(&mut self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, LinkError> {
        self.call(HEARTBEAT_DEVICE_PATH, request)
    }

    fn report_pause(&mut self, report: &SessionReport) -> Result<(), LinkError> {
        self.send(PAUSE_DEVICE_PATH, report)
    }

    fn report_stop(&mut self, report: &SessionReport) -> Result<(), LinkError> {
        self.send(STOP_DEVICE_PATH, report)
    }

    fn confirm_delete(&mut self, confirmation: &DeleteConfirmation) -> Result<(), LinkError> {
        self.send(DEVICE_DELETE_RESPONSE_PATH, confirmation)
    }
}
