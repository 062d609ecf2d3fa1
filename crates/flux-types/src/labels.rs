use std::collections::BTreeMap;

/// 标签集合（按键排序，保证序列化与指纹稳定）
pub type Labels = BTreeMap<String, String>;

/// 生成标签集合的规范化键，例如 `host="a",service="checkout"`
pub fn labels_key(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",")
}

/// 检查标签是否满足过滤条件（过滤条件中的每个键值都必须完全相等）
pub fn matches_filter(labels: &Labels, filter: &Labels) -> bool {
    filter
        .iter()
        .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
}
