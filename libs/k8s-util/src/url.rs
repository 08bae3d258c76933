/// Collapse the variable segments of an apiserver request path so it can be
/// used as a bounded-cardinality metric label.
///
/// `/api/v1/namespaces/runboat-builds/pods/foo` becomes
/// `/api/v1/namespaces/{namespace}/pods/{name}`. Paths that do not look like
/// apiserver resource paths collapse to `/{prefix}`.
pub fn template_path(path: &str) -> String {
    let without_query = path.split('?').next().unwrap_or(path);
    let mut segments: Vec<&str> = without_query.split('/').filter(|s| !s.is_empty()).collect();

    if segments.len() <= 2 {
        return without_query.to_owned();
    }

    // `/api/v1/...` for the core group, `/apis/<group>/<version>/...` otherwise
    let resource_start = match segments[0] {
        "api" => 2,
        "apis" => 3,
        _ => return "/{prefix}".to_owned(),
    };
    if segments.len() < resource_start {
        return "/{prefix}".to_owned();
    }

    let mut i = resource_start;
    if segments.get(i) == Some(&"namespaces") && segments.len() > i + 1 {
        segments[i + 1] = "{namespace}";
        i += 2;
    }
    // past the (possibly namespaced) resource segment sits the object name,
    // unless the trailing segment is a subresource like `status` or `scale`
    if segments.len() > i + 1 {
        segments[i + 1] = "{name}";
    }

    format!("/{}", segments.join("/"))
}

/// The resource collection a request path addresses (`deployments`,
/// `jobs`, `pods`, ...), or `other` for anything that is not an apiserver
/// resource path. Built on [`template_path`] so subresources and object
/// names do not fan out the result.
pub fn resource_kind(path: &str) -> String {
    let templated = template_path(path);
    let segments: Vec<&str> = templated.split('/').filter(|s| !s.is_empty()).collect();
    let resource = match segments.iter().position(|s| *s == "{name}") {
        Some(i) if i >= 1 => segments[i - 1],
        Some(_) => "",
        None => segments.last().copied().unwrap_or(""),
    };
    match resource {
        "" | "{prefix}" => "other".to_string(),
        r => r.to_string(),
    }
}
