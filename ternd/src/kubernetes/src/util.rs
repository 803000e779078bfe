use kube::{Resource, ResourceExt};

use super::error::Error;

pub fn get_namespace<T: Resource<DynamicType = ()>>(resource: &T) -> Result<String, Error> {
    resource.namespace().ok_or(Error::GetNamespace)
}

pub fn get_namespaced_name<T: Resource<DynamicType = ()>>(resource: &T) -> String {
    match resource.namespace() {
        Some(ns) => format!("{ns}/{}", resource.name_any()),
        None => resource.name_any(),
    }
}

pub fn diff<T: PartialEq + Clone>(prev: &[T], now: &[T]) -> (Vec<T>, Vec<T>, Vec<T>) {
    let removed = prev
        .iter()
        .filter(|p| !now.contains(p))
        .cloned()
        .collect::<Vec<T>>();
    let added = now
        .iter()
        .filter(|n| !prev.contains(n))
        .cloned()
        .collect::<Vec<T>>();
    let shared = prev
        .iter()
        .filter(|p| now.contains(p))
        .cloned()
        .collect::<Vec<T>>();
    (added, shared, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn works_diff() {
        let prev = vec!["a".to_string(), "b".to_string()];
        let now = vec!["b".to_string(), "c".to_string()];
        let (added, shared, removed) = diff(&prev, &now);
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(shared, vec!["b".to_string()]);
        assert_eq!(removed, vec!["a".to_string()]);
    }
}
