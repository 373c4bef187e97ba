//! `http.get`, `http.post`, `http.request` and the global `request`
//!
//! Requests block the session thread. Every URL passes the session's
//! network policy first. Non-2xx answers still produce a response table,
//! with `Success = false`.

use std::rc::Rc;

use mlua::{Lua, MultiValue, Table, Value};
use tether_engine_core::http::{HttpClient, HttpConfig, HttpRequest, HttpResponse, Method};
use tether_engine_core::AdapterLifecycle;
use tether_policy::{validate_url, NetworkPolicy};

use crate::bindings::{arg_bytes, arg_string, arg_table, display_value, nil_with, opt_string};
use crate::{Capability, InstallContext};

pub struct HttpLib {
    client: Rc<HttpClient>,
    policy: Rc<NetworkPolicy>,
    lifecycle: AdapterLifecycle,
}

impl HttpLib {
    pub fn new(config: &HttpConfig, policy: NetworkPolicy) -> Self {
        Self {
            client: Rc::new(HttpClient::new(config)),
            policy: Rc::new(policy),
            lifecycle: AdapterLifecycle::new("http"),
        }
    }
}

fn response_table(lua: &Lua, response: &HttpResponse) -> mlua::Result<Table> {
    let headers = lua.create_table()?;
    for (name, value) in &response.headers {
        headers.set(name.as_str(), value.as_str())?;
    }

    let table = lua.create_table()?;
    table.set("Success", response.success())?;
    table.set("StatusCode", response.status)?;
    table.set("StatusMessage", response.status_message.as_str())?;
    table.set("Body", lua.create_string(&response.body)?)?;
    table.set("Headers", headers)?;
    Ok(table)
}

fn perform(
    lua: &Lua,
    client: &HttpClient,
    policy: &NetworkPolicy,
    request: Result<HttpRequest, String>,
) -> mlua::Result<MultiValue> {
    let request = match request {
        Ok(request) => request,
        Err(e) => return nil_with(lua, e),
    };
    if let Err(rejection) = validate_url(&request.url, policy).into_result() {
        tracing::debug!(url = %request.url, %rejection, "HTTP request refused");
        return nil_with(lua, rejection);
    }
    match client.execute(&request) {
        Ok(response) => Ok(MultiValue::from_vec(vec![Value::Table(response_table(
            lua, &response,
        )?)])),
        Err(e) => nil_with(lua, e),
    }
}

/// Read a `request{...}` options table
fn parse_options(options: &Value) -> Result<HttpRequest, String> {
    let options = arg_table(options, "options")?;
    let field = |name: &str| options.get::<Value>(name).map_err(|e| e.to_string());

    let url = match field("Url")? {
        Value::Nil => return Err("Url is required".into()),
        url => arg_string(&url, "Url")?,
    };
    let method = match opt_string(&field("Method")?, "Method")? {
        Some(name) => Method::parse(&name).map_err(|e| e.to_string())?,
        None => Method::Get,
    };
    let body = match field("Body")? {
        Value::Nil => Vec::new(),
        body => arg_bytes(&body, "Body")?,
    };
    let content_type = opt_string(&field("ContentType")?, "ContentType")?;

    let mut headers = Vec::new();
    if let Value::Table(table) = field("Headers")? {
        for pair in table.pairs::<Value, Value>() {
            let (name, value) = pair.map_err(|e| e.to_string())?;
            headers.push((display_value(&name), display_value(&value)));
        }
    }

    Ok(HttpRequest {
        url,
        method,
        body,
        content_type,
        headers,
    })
}

impl Capability for HttpLib {
    fn name(&self) -> &'static str {
        "http"
    }

    fn install(&self, lua: &Lua, _ctx: &InstallContext) -> mlua::Result<()> {
        let http = lua.create_table()?;

        let (client, policy) = (self.client.clone(), self.policy.clone());
        http.set(
            "get",
            lua.create_function(move |lua, url: Value| {
                let request = arg_string(&url, "url").map(HttpRequest::get);
                perform(lua, &client, &policy, request)
            })?,
        )?;

        let (client, policy) = (self.client.clone(), self.policy.clone());
        http.set(
            "post",
            lua.create_function(move |lua, (url, body, content_type): (Value, Value, Value)| {
                let request = (|| {
                    let mut request =
                        HttpRequest::post(arg_string(&url, "url")?, arg_bytes(&body, "body")?);
                    request.content_type = opt_string(&content_type, "content_type")?;
                    Ok::<_, String>(request)
                })();
                perform(lua, &client, &policy, request)
            })?,
        )?;

        let (client, policy) = (self.client.clone(), self.policy.clone());
        let request = lua.create_function(move |lua, options: Value| {
            perform(lua, &client, &policy, parse_options(&options))
        })?;
        http.set("request", request.clone())?;

        let globals = lua.globals();
        globals.set("http", http)?;
        globals.set("request", request.clone())?;
        globals.set("http_request", request)?;

        self.lifecycle.activate();
        Ok(())
    }

    fn lifecycle(&self) -> &AdapterLifecycle {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{eval, session_with};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    /// Answer one request with `status`, echoing the request line, the
    /// content type and the body
    fn one_shot_server(status: &'static str) -> (String, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api", listener.local_addr().unwrap());
        let thread = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();

            let mut content_length = 0usize;
            let mut content_type = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(v) = lower.strip_prefix("content-length:") {
                    content_length = v.trim().parse().unwrap();
                }
                if let Some(v) = lower.strip_prefix("content-type:") {
                    content_type = v.trim().to_string();
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();

            let reply = format!(
                "{}|{}|{}",
                request_line.trim(),
                content_type,
                String::from_utf8_lossy(&body)
            );
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nX-Test: yes\r\nConnection: close\r\n\r\n{reply}",
                reply.len()
            )
            .unwrap();
        });
        (url, thread)
    }

    fn lib() -> Box<HttpLib> {
        Box::new(HttpLib::new(&HttpConfig::default(), NetworkPolicy::default()))
    }

    #[test]
    fn get_builds_response_table() {
        let (url, server) = one_shot_server("200 OK");
        let session = session_with(lib());
        session.lua().globals().set("URL", url).unwrap();

        let (success, status, message, body, header): (bool, u16, String, String, String) = eval(
            &session,
            "local r = http.get(URL) \
             return r.Success, r.StatusCode, r.StatusMessage, r.Body, r.Headers['x-test']",
        );
        assert!(success);
        assert_eq!(status, 200);
        assert_eq!(message, "OK");
        assert_eq!(body, "GET /api HTTP/1.1||");
        assert_eq!(header, "yes");
        server.join().unwrap();
    }

    #[test]
    fn request_with_options() {
        let (url, server) = one_shot_server("404 Not Found");
        let session = session_with(lib());
        session.lua().globals().set("URL", url).unwrap();

        let (success, status, body): (bool, u16, String) = eval(
            &session,
            "local r = request{Url = URL, Method = 'PUT', Body = 'data', ContentType = 'text/plain'} \
             return r.Success, r.StatusCode, r.Body",
        );
        assert!(!success);
        assert_eq!(status, 404);
        assert_eq!(body, "PUT /api HTTP/1.1|text/plain|data");
        server.join().unwrap();
    }

    #[test]
    fn post_defaults_to_json() {
        let (url, server) = one_shot_server("201 Created");
        let session = session_with(lib());
        session.lua().globals().set("URL", url).unwrap();

        let body: String = eval(&session, "return http.post(URL, '{}').Body");
        assert_eq!(body, "POST /api HTTP/1.1|application/json|{}");
        server.join().unwrap();
    }

    #[test]
    fn refused_urls_return_nil_and_message() {
        let mut policy = NetworkPolicy::default();
        policy.deny_host("blocked.example");
        let session = session_with(Box::new(HttpLib::new(&HttpConfig::default(), policy)));

        let (value, message): (Value, String) =
            eval(&session, "return http.get('http://api.blocked.example/x')");
        assert!(value.is_nil());
        assert!(message.contains("blocked.example"));

        let (value, message): (Value, String) = eval(&session, "return http.get('file:///etc/passwd')");
        assert!(value.is_nil());
        assert!(message.contains("file"));

        let (value, message): (Value, String) = eval(&session, "return request{}");
        assert!(value.is_nil());
        assert_eq!(message, "Url is required");

        let (value, _): (Value, String) =
            eval(&session, "return request{Url = 'http://x.test', Method = 'BREW'}");
        assert!(value.is_nil());
    }
}
