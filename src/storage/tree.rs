//! 数据树路径操作（内存存储和远程快照共用）

use super::ValueTree;
use serde_json::Map;

/// 读取路径处的节点
pub fn get_at<'a, S: AsRef<str>>(root: &'a ValueTree, path: &[S]) -> Option<&'a ValueTree> {
    let mut node = root;
    for segment in path {
        node = node.as_object()?.get(segment.as_ref())?;
    }
    Some(node)
}

/// 取得路径处的可变节点，沿途不存在或非对象的节点替换为空对象
fn node_mut<'a, S: AsRef<str>>(root: &'a mut ValueTree, path: &[S]) -> &'a mut ValueTree {
    let mut node = root;
    for segment in path {
        if !node.is_object() {
            *node = ValueTree::Object(Map::new());
        }
        node = match node {
            ValueTree::Object(map) => map
                .entry(segment.as_ref().to_string())
                .or_insert(ValueTree::Null),
            _ => unreachable!("节点已转换为对象"),
        };
    }
    node
}

/// 整体替换路径处的节点，null 表示删除
pub fn set_at<S: AsRef<str>>(root: &mut ValueTree, path: &[S], value: ValueTree) {
    *node_mut(root, path) = value;
    prune(root, path);
}

/// 更新语义：对象值逐个替换子节点，值为 null 的子节点被删除，未出现的兄弟节点保持不变。
/// 非对象值直接替换节点。
pub fn merge_at<S: AsRef<str>>(root: &mut ValueTree, path: &[S], value: &ValueTree) {
    match value {
        ValueTree::Object(children) => {
            let node = node_mut(root, path);
            if !node.is_object() {
                *node = ValueTree::Object(Map::new());
            }
            if let ValueTree::Object(map) = node {
                for (key, child) in children {
                    if child.is_null() {
                        map.remove(key);
                    } else {
                        map.insert(key.clone(), child.clone());
                    }
                }
            }
            prune(root, path);
        }
        other => set_at(root, path, other.clone()),
    }
}

/// 清理路径上的 null 和空对象，与远程存储“空节点不存在”的语义一致
fn prune<S: AsRef<str>>(root: &mut ValueTree, path: &[S]) {
    for depth in (0..path.len()).rev() {
        if !matches!(get_at(root, &path[..depth]), Some(ValueTree::Object(_))) {
            return;
        }
        if let ValueTree::Object(map) = node_mut(root, &path[..depth]) {
            let key = path[depth].as_ref();
            let empty = match map.get(key) {
                Some(ValueTree::Null) => true,
                Some(ValueTree::Object(child)) => child.is_empty(),
                _ => false,
            };
            if !empty {
                return;
            }
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_siblings() {
        let mut root = json!({"a": {"x": 1, "z": 5}, "b": 2});
        merge_at(&mut root, &["a"], &json!({"x": 2}));
        assert_eq!(root, json!({"a": {"x": 2, "z": 5}, "b": 2}));

        merge_at(&mut root, &[] as &[&str], &json!({"c": 3}));
        assert_eq!(root, json!({"a": {"x": 2, "z": 5}, "b": 2, "c": 3}));
    }

    #[test]
    fn test_merge_replaces_child_wholesale() {
        let mut root = json!({"a": {"x": 1, "z": 5}});
        merge_at(&mut root, &[] as &[&str], &json!({"a": {"x": 9}}));
        assert_eq!(root, json!({"a": {"x": 9}}));
    }

    #[test]
    fn test_null_removes_and_prunes() {
        let mut root = json!({"a": {"x": 1}, "b": 2});
        merge_at(&mut root, &["a"], &json!({"x": null}));
        assert_eq!(root, json!({"b": 2}));

        set_at(&mut root, &["b"], ValueTree::Null);
        assert_eq!(root, json!({}));
    }

    #[test]
    fn test_set_creates_intermediate_nodes() {
        let mut root = ValueTree::Null;
        set_at(&mut root, &["a", "b"], json!(1));
        assert_eq!(root, json!({"a": {"b": 1}}));
        assert_eq!(get_at(&root, &["a", "b"]), Some(&json!(1)));
        assert_eq!(get_at(&root, &["a", "c"]), None);
    }

    #[test]
    fn test_scalar_merge_replaces_node() {
        let mut root = json!({"a": {"x": 1}});
        merge_at(&mut root, &["a"], &json!("text"));
        assert_eq!(root, json!({"a": "text"}));
    }
}
