//! Per-backend request interception scripts.
//!
//! Scripts register routes on a `proxy` object (`get`/`post`/`all`) and
//! either answer the request (`res.send`/`res.json`), pass it through
//! (`res.proxy()`), or fall through to 404. The embedded engine is
//! `boa_engine`; the host boundary is JSON only: the request is injected as
//! a JSON value and the dispatch result is read back the same way, so no
//! engine types escape this module. A fresh engine context is created per
//! evaluation, matching the per-request isolation of the route handlers.

use boa_engine::{Context, JsValue, Source};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use ubergang_common::{Error, Result};

/// Injected before every script. Keeps route registration, path matching and
/// response recording inside the engine so the host only exchanges JSON.
const PRELUDE: &str = r#"
'use strict';
const __routes = [];
const __publishes = [];
const proxy = {
    get(path, handler) { __routes.push({ method: 'GET', path, handler }); },
    post(path, handler) { __routes.push({ method: 'POST', path, handler }); },
    all(path, handler) { __routes.push({ method: '', path, handler }); },
};
const mqtt = {
    publish(topic, payload, options) {
        const opts = options || {};
        __publishes.push({
            topic: String(topic),
            payload: String(payload),
            qos: (opts.qos | 0),
            retain: Boolean(opts.retain),
        });
    },
    isConnected() { return __MQTT_CONNECTED; },
};
function __compile(path) {
    const params = [];
    let pattern = path.replace(/:([a-zA-Z0-9_]+)/g, (m, name) => {
        params.push(name);
        return '([^/]+)';
    });
    pattern = pattern.split('*').join('(.*)');
    return { regex: new RegExp('^' + pattern + '$'), params };
}
function __dispatch(req) {
    const out = { status: 200, sent: false, proxy: false, body: null, json: null, error: null };
    const res = {
        status(code) { out.status = (code | 0); return res; },
        send(body) {
            if (!out.sent && !out.proxy) { out.sent = true; out.body = String(body); }
        },
        json(obj) {
            if (!out.sent && !out.proxy) { out.sent = true; out.json = obj; }
        },
        proxy() { out.proxy = true; },
    };
    for (const route of __routes) {
        if (route.method !== '' && route.method !== req.method) continue;
        const compiled = __compile(route.path);
        const m = compiled.regex.exec(req.path);
        if (m === null) continue;
        for (let i = 0; i < compiled.params.length && i + 1 < m.length; i++) {
            req.params[compiled.params[i]] = m[i + 1];
        }
        try {
            route.handler(req, res);
        } catch (e) {
            if (!out.sent) { out.error = String(e); }
        }
        return out;
    }
    return null;
}
"#;

/// Request view handed to scripts. Header and query maps carry the first
/// value per name; header names are lowercase.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptRequest {
    pub method: String,
    pub path: String,
    pub params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MqttPublish {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// What the script decided about the request.
#[derive(Debug, PartialEq)]
pub enum ScriptDecision {
    /// Forward to the backend.
    Proxy,
    /// The script produced the response.
    Respond {
        status: u16,
        content_type: Option<&'static str>,
        body: Vec<u8>,
    },
    /// No route matched, or the matching handler neither sent nor proxied.
    NotFound,
    /// The handler threw; the error text becomes a 500 body.
    Failed(String),
}

pub struct ScriptOutcome {
    pub decision: ScriptDecision,
    pub publishes: Vec<MqttPublish>,
}

#[derive(Deserialize)]
struct RawDispatch {
    status: u16,
    sent: bool,
    proxy: bool,
    body: Option<String>,
    json: Option<serde_json::Value>,
    error: Option<String>,
}

fn eval(ctx: &mut Context, src: &str) -> Result<JsValue> {
    ctx.eval(Source::from_bytes(src))
        .map_err(|e| Error::Internal(format!("script error: {e}")))
}

fn new_context(script: &str, mqtt_connected: bool) -> Result<Context> {
    let mut ctx = Context::default();
    let bootstrap = format!("const __MQTT_CONNECTED = {mqtt_connected};");
    eval(&mut ctx, &bootstrap)?;
    eval(&mut ctx, PRELUDE)?;
    eval(&mut ctx, script)?;
    Ok(ctx)
}

/// Validate a script by evaluating it against the prelude. Used at backend
/// resolve time so broken scripts fail the resolve.
pub fn check_script(script: &str) -> Result<()> {
    new_context(script, false)
        .map(|_| ())
        .map_err(|e| Error::InvalidConfig(e.to_string()))
}

/// Evaluate `script` against `req`. The request enters the engine as a JSON
/// literal and the result leaves as a `JSON.stringify` string, so the host
/// never exchanges engine values directly.
pub fn execute(script: &str, req: &ScriptRequest, mqtt_connected: bool) -> Result<ScriptOutcome> {
    let mut ctx = new_context(script, mqtt_connected)?;

    let req_json = serde_json::to_string(req)?;
    eval(&mut ctx, &format!("const __REQ = {req_json};"))?;
    let result = eval(
        &mut ctx,
        "JSON.stringify({ out: (__dispatch(__REQ) ?? null), publishes: __publishes })",
    )?;
    let text = result
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| Error::Internal("script result conversion failed".into()))?;

    #[derive(Deserialize)]
    struct Wrapper {
        out: Option<RawDispatch>,
        // Publishes accumulate globally: top-level `mqtt.publish` calls
        // count even when no route matched.
        #[serde(default)]
        publishes: Vec<MqttPublish>,
    }
    let wrapper: Wrapper = serde_json::from_str(&text)?;
    let publishes = wrapper.publishes;

    let Some(raw) = wrapper.out else {
        return Ok(ScriptOutcome {
            decision: ScriptDecision::NotFound,
            publishes,
        });
    };

    let decision = if let Some(error) = raw.error {
        ScriptDecision::Failed(error)
    } else if raw.sent {
        match raw.json {
            Some(value) => ScriptDecision::Respond {
                status: raw.status,
                content_type: Some("application/json"),
                body: serde_json::to_vec(&value)?,
            },
            None => ScriptDecision::Respond {
                status: raw.status,
                content_type: None,
                body: raw.body.unwrap_or_default().into_bytes(),
            },
        }
    } else if raw.proxy {
        ScriptDecision::Proxy
    } else {
        ScriptDecision::NotFound
    };

    Ok(ScriptOutcome {
        decision,
        publishes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, path: &str) -> ScriptRequest {
        ScriptRequest {
            method: method.into(),
            path: path.into(),
            params: HashMap::new(),
            headers: HashMap::new(),
            query: HashMap::new(),
        }
    }

    #[test]
    fn test_send_short_circuits() {
        let script = r#"
            proxy.get('/api/health', (req, res) => {
                res.status(200).send('Proxy is Healthy');
            });
        "#;
        let out = execute(script, &request("GET", "/api/health"), false).unwrap();
        assert_eq!(
            out.decision,
            ScriptDecision::Respond {
                status: 200,
                content_type: None,
                body: b"Proxy is Healthy".to_vec(),
            }
        );
    }

    #[test]
    fn test_proxy_through() {
        let script = r#"
            proxy.all('/secure/*', (req, res) => {
                if (req.headers['x-api-key'] === 'secret-token') {
                    res.proxy();
                } else {
                    res.status(401).send('Unauthorized');
                }
            });
        "#;
        let mut req = request("GET", "/secure/data");
        req.headers.insert("x-api-key".into(), "secret-token".into());
        let out = execute(script, &req, false).unwrap();
        assert_eq!(out.decision, ScriptDecision::Proxy);

        let req = request("GET", "/secure/data");
        let out = execute(script, &req, false).unwrap();
        assert!(matches!(
            out.decision,
            ScriptDecision::Respond { status: 401, .. }
        ));
    }

    #[test]
    fn test_no_match_is_not_found() {
        let script = "proxy.get('/only', (req, res) => res.proxy());";
        let out = execute(script, &request("GET", "/other"), false).unwrap();
        assert_eq!(out.decision, ScriptDecision::NotFound);
    }

    #[test]
    fn test_params_captured() {
        let script = r#"
            proxy.get('/users/:id/posts/:postId', (req, res) => {
                res.json({ user: req.params.id, post: req.params.postId });
            });
        "#;
        let out = execute(script, &request("GET", "/users/42/posts/7"), false).unwrap();
        match out.decision {
            ScriptDecision::Respond { status, body, .. } => {
                assert_eq!(status, 200);
                let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(v["user"], "42");
                assert_eq!(v["post"], "7");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_first_matching_route_wins() {
        let script = r#"
            proxy.all('/a/*', (req, res) => res.send('first'));
            proxy.all('/a/b', (req, res) => res.send('second'));
        "#;
        let out = execute(script, &request("GET", "/a/b"), false).unwrap();
        assert!(matches!(
            out.decision,
            ScriptDecision::Respond { ref body, .. } if body == b"first"
        ));
    }

    #[test]
    fn test_method_filter() {
        let script = "proxy.post('/submit', (req, res) => res.send('ok'));";
        let out = execute(script, &request("GET", "/submit"), false).unwrap();
        assert_eq!(out.decision, ScriptDecision::NotFound);
        let out = execute(script, &request("POST", "/submit"), false).unwrap();
        assert!(matches!(out.decision, ScriptDecision::Respond { .. }));
    }

    #[test]
    fn test_handler_error_is_failed() {
        let script = "proxy.get('/boom', (req, res) => { throw new Error('kaput'); });";
        let out = execute(script, &request("GET", "/boom"), false).unwrap();
        match out.decision {
            ScriptDecision::Failed(msg) => assert!(msg.contains("kaput")),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_broken_script_fails_check() {
        assert!(check_script("proxy.get('/x', (req, res) =>").is_err());
        assert!(check_script("proxy.get('/x', (req, res) => res.proxy());").is_ok());
    }

    #[test]
    fn test_mqtt_publish_collected() {
        let script = r#"
            proxy.get('/notify', (req, res) => {
                mqtt.publish('alerts/door', 'open', { qos: 1, retain: true });
                res.send('sent');
            });
        "#;
        let out = execute(script, &request("GET", "/notify"), true).unwrap();
        assert_eq!(
            out.publishes,
            vec![MqttPublish {
                topic: "alerts/door".into(),
                payload: "open".into(),
                qos: 1,
                retain: true,
            }]
        );
    }

    #[test]
    fn test_is_connected_visible() {
        let script = r#"
            proxy.get('/status', (req, res) => {
                res.send(mqtt.isConnected() ? 'up' : 'down');
            });
        "#;
        let out = execute(script, &request("GET", "/status"), true).unwrap();
        assert!(matches!(
            out.decision,
            ScriptDecision::Respond { ref body, .. } if body == b"up"
        ));
    }
}
