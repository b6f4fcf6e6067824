use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::flow::state::{StateValue, Variables};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("placeholder pattern is valid"));

/// Looks up `name`, following dots into map values (`order.id`).
pub fn lookup_variable<'a>(vars: &'a Variables, name: &str) -> Option<&'a StateValue> {
    if let Some(direct) = vars.get(name) {
        return Some(direct);
    }
    let mut parts = name.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = current.as_map()?.get(part)?;
    }
    Some(current)
}

/// Replaces every `{{name}}` with the display form of the variable.
/// Unknown names stay in the text untouched.
pub fn render_template(text: &str, vars: &Variables) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| match lookup_variable(vars, &caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Variables {
        let mut vars = Variables::new();
        vars.insert("name".into(), StateValue::from("World"));
        vars.insert("age".into(), StateValue::Number(30.0));
        vars.insert("order".into(), StateValue::from(json!({"id": 7, "status": "paid"})));
        vars
    }

    #[test]
    fn replaces_known_names() {
        assert_eq!(render_template("Hi {{name}}!", &vars()), "Hi World!");
        assert_eq!(render_template("{{ name }} is {{age}}", &vars()), "World is 30");
    }

    #[test]
    fn leaves_unknown_names() {
        assert_eq!(render_template("Hi {{nome}}", &vars()), "Hi {{nome}}");
        assert_eq!(render_template("no placeholders", &vars()), "no placeholders");
    }

    #[test]
    fn dotted_names_reach_into_maps() {
        assert_eq!(render_template("Pedido {{order.id}}: {{order.status}}", &vars()), "Pedido 7: paid");
        assert_eq!(render_template("{{order.missing}}", &vars()), "{{order.missing}}");
    }
}
