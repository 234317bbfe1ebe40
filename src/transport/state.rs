//! State reads: `GET` over a keypath, tx-by-id, and the browser bundle.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;

use crate::error::{Error, Result};
use crate::tree::nelson::{
    guess_content_type_from_filename, ResolvedBody, ResolvedValue, CONTENT_TYPE_OCTET_STREAM,
};
use crate::tree::{Node, Range};
use crate::types::{Keypath, Version};

use super::{header_or_query, header_str, json_response, query_params, Transport};

/// Content types a client may open a subscription on.
const SUBSCRIBABLE_CONTENT_TYPES: [&str; 3] =
    ["application/json", "application/js", "text/plain"];

/// `GET /braid.js`: the embedded browser client, when configured.
pub(super) fn serve_browser_js(transport: &Transport) -> Result<Response> {
    let bundle = transport
        .config()
        .browser_js
        .clone()
        .ok_or_else(|| Error::NotFound("no browser bundle configured".into()))?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/javascript")
        .body(Body::from(bundle))
        .expect("response construction is infallible"))
}

/// `GET /__tx/{id}`: fetch a tx by id.
pub(super) async fn serve_get_tx(
    transport: &Transport,
    tx_id: String,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
) -> Result<Response> {
    let params = query_params(uri);
    let state_uri = header_or_query(headers, &params, "State-URI", "state_uri")
        .map(str::to_owned)
        .ok_or_else(|| Error::BadRequest("missing State-URI".into()))?;

    let tx_id =
        Version::from_hex(&tx_id).map_err(|_| Error::BadRequest("bad tx id".into()))?;

    let tx = transport
        .controller_hub()
        .fetch_tx(&state_uri, tx_id)
        .await
        .map_err(|e| Error::NotFound(e.to_string()))?;

    json_response(&tx)
}

/// Parse the repurposed `Range` header. Only `json=START:END` is accepted;
/// the literal `bytes=0-` is tolerated as a no-op for naive HTTP caches.
fn parse_range(headers: &HeaderMap) -> Result<Option<Range>> {
    let raw = match header_str(headers, "Range") {
        Some(raw) if raw != "bytes=0-" => raw,
        _ => return Ok(None),
    };
    let bad = || Error::BadRequest("bad Range header".into());

    let (unit, bounds) = raw.split_once('=').ok_or_else(bad)?;
    if unit != "json" {
        return Err(bad());
    }
    let (start, end) = bounds.split_once(':').ok_or_else(bad)?;
    Ok(Some(Range {
        start: start.parse().map_err(|_| bad())?,
        end: end.parse().map_err(|_| bad())?,
    }))
}

fn parse_raw_param(params: &std::collections::HashMap<String, String>) -> Result<bool> {
    match params.get("raw").map(String::as_str) {
        None | Some("") => Ok(false),
        Some("1") | Some("true") | Some("t") | Some("T") | Some("TRUE") | Some("True") => Ok(true),
        Some("0") | Some("false") | Some("f") | Some("F") | Some("FALSE") | Some("False") => {
            Ok(false)
        }
        Some(other) => Err(Error::BadRequest(format!("bad raw param: {other}"))),
    }
}

/// `GET *`: resolve `(state URI, version, keypath, range, index, raw)` into
/// a typed response.
pub(super) async fn serve_get_state(transport: &Transport, req: &Request) -> Result<Response> {
    let headers = req.headers();
    let params = query_params(req.uri());

    let state_uri = header_or_query(headers, &params, "State-URI", "state_uri")
        .map(str::to_owned)
        .or_else(|| transport.config().default_state_uri.clone())
        .unwrap_or_default();

    let version = header_str(headers, "Version")
        .map(Version::from_hex)
        .transpose()
        .map_err(|_| Error::BadRequest("bad Version header".into()))?;

    let mut keypath = Keypath::from_url_path(req.uri().path())?;
    let range = parse_range(headers)?;

    let filename = params.get("filename").filter(|f| !f.is_empty()).cloned();
    let (index_name, index_arg) = (params.get("index"), params.get("index_arg"));
    let raw = parse_raw_param(&params)?;

    // The Parents header is always set: the first leaf's parents, or empty.
    let leaves = transport
        .controller_hub()
        .leaves(&state_uri)
        .await
        .map_err(|e| Error::NotFound(e.to_string()))?;
    let parents_header = match leaves.first() {
        Some(leaf) => {
            let tx = transport
                .controller_hub()
                .fetch_tx(&state_uri, *leaf)
                .await
                .map_err(|e| Error::NotFound(format!("can't fetch tx {leaf}: {e}")))?;
            tx.parents
                .iter()
                .map(Version::hex)
                .collect::<Vec<_>>()
                .join(",")
        }
        None => String::new(),
    };

    let hub = transport.controller_hub();
    let resolver = transport.resolver();

    let (node, any_missing, body): (Node, bool, ResolvedBody) = if let Some(index_name) = index_name
    {
        // Index query. `index_arg=*` means the whole index.
        let index_arg = index_arg
            .filter(|arg| arg.as_str() != "*")
            .map(|arg| Keypath::new(arg.clone()));
        let node = hub
            .query_index(
                &state_uri,
                version,
                &keypath,
                &Keypath::new(index_name.clone()),
                index_arg,
                range,
            )
            .await?;
        let value = node
            .value()
            .ok_or_else(|| Error::NotFound(keypath.to_string()))?;
        (node, false, ResolvedBody::Json(value))
    } else {
        let root = hub
            .state_at_version(&state_uri, version)
            .await
            .map_err(|e| Error::NotFound(e.to_string()))?;

        if raw {
            let node = root.node_at(&keypath, range);
            let value = node
                .value()
                .ok_or_else(|| Error::NotFound(keypath.to_string()))?;
            (node, false, ResolvedBody::Json(value))
        } else {
            let mut node = resolver
                .seek(&root, &keypath)
                .await?
                .ok_or_else(|| Error::NotFound(keypath.to_string()))?;

            // Directory-index behavior for web serving.
            let index_html = Keypath::new("index.html");
            if let Some(child) = resolver.seek(&node, &index_html).await? {
                node = child;
                keypath = keypath.push("index.html");
            }

            let ResolvedValue { body, any_missing } = resolver
                .value_recursive(&node)
                .await?
                .ok_or_else(|| Error::NotFound(keypath.to_string()))?;
            (node, any_missing, body_with_range(body, range))
        }
    };

    let mut content_type = resolver.content_type(&node).await?;
    if content_type == CONTENT_TYPE_OCTET_STREAM {
        content_type = guess_content_type_from_filename(keypath.last_part().unwrap_or_default());
    }

    let content_length = resolver.content_length(&node).await?;
    let resource_length = node.length();

    let mut builder = Response::builder()
        .status(if any_missing {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_TYPE, content_type.clone())
        .header("Resource-Length", resource_length.to_string())
        .header("Parents", parents_header);

    if content_length > 0 {
        builder = builder.header(header::CONTENT_LENGTH, content_length.to_string());
    }
    if let Some(filename) = filename {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={filename}"),
        );
    }

    // Streamed bodies keep their advertised type; anything else went out as
    // JSON, which is what decides subscribability.
    let effective_type = match &body {
        ResolvedBody::Stream(_) => content_type.as_str(),
        ResolvedBody::Json(_) => "application/json",
    };
    if SUBSCRIBABLE_CONTENT_TYPES.contains(&effective_type) {
        builder = builder.header("Subscribe", "Allow");
    }

    // Header values here come from state data and query params, so the
    // builder can legitimately fail.
    match body {
        ResolvedBody::Json(value) => builder.body(Body::from(serde_json::to_vec(&value)?)),
        ResolvedBody::Stream(stream) => builder.body(Body::from_stream(stream)),
    }
    .map_err(|e| Error::Internal(format!("building response: {e}")))
}

/// Apply a `json=S:E` range to an already-materialized JSON value.
fn body_with_range(body: ResolvedBody, range: Option<Range>) -> ResolvedBody {
    let Some(range) = range else { return body };
    match body {
        ResolvedBody::Json(serde_json::Value::Array(items)) => {
            let (start, end) = range.resolve(items.len());
            ResolvedBody::Json(serde_json::Value::Array(items[start..end].to_vec()))
        }
        ResolvedBody::Json(serde_json::Value::String(s)) => {
            let (start, end) = range.resolve(s.len());
            ResolvedBody::Json(serde_json::Value::String(
                s.get(start..end).unwrap_or_default().to_string(),
            ))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_range(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Range", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_range_bytes_zero_dash_is_ignored() {
        assert_eq!(parse_range(&headers_with_range("bytes=0-")).unwrap(), None);
        assert_eq!(parse_range(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn test_range_json_with_negative_end() {
        assert_eq!(
            parse_range(&headers_with_range("json=5:-1")).unwrap(),
            Some(Range { start: 5, end: -1 })
        );
    }

    #[test]
    fn test_range_rejects_other_units() {
        assert!(parse_range(&headers_with_range("bytes=0-100")).is_err());
        assert!(parse_range(&headers_with_range("lines=1:2")).is_err());
        assert!(parse_range(&headers_with_range("json=1")).is_err());
        assert!(parse_range(&headers_with_range("json=a:b")).is_err());
    }

    #[test]
    fn test_parse_raw_param() {
        let mut params = std::collections::HashMap::new();
        assert!(!parse_raw_param(&params).unwrap());
        params.insert("raw".to_string(), "1".to_string());
        assert!(parse_raw_param(&params).unwrap());
        params.insert("raw".to_string(), "banana".to_string());
        assert!(parse_raw_param(&params).is_err());
    }

    #[test]
    fn test_body_with_range_slices_arrays() {
        let body = ResolvedBody::Json(serde_json::json!([0, 1, 2, 3]));
        let ranged = body_with_range(body, Some(Range { start: 1, end: 3 }));
        match ranged {
            ResolvedBody::Json(value) => assert_eq!(value, serde_json::json!([1, 2])),
            _ => panic!("expected json"),
        }
    }
}
