//! Sample methods served by the demo.

use rpcd_core::{Fault, Method, Value};

/// Returns its parameters unchanged.
pub struct Echo;

impl Method for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn help(&self) -> String {
        "Return the parameters as an array".to_string()
    }

    fn execute(&self, params: &Value) -> Result<Value, Fault> {
        Ok(params.clone())
    }
}

/// Sums integer parameters.
pub struct Add;

impl Method for Add {
    fn name(&self) -> &str {
        "add"
    }

    fn help(&self) -> String {
        "Sum all integer parameters".to_string()
    }

    fn execute(&self, params: &Value) -> Result<Value, Fault> {
        let args = params.as_array().unwrap_or(&[]);
        let mut sum: i32 = 0;
        for arg in args {
            let n = arg
                .as_i32()
                .ok_or_else(|| Fault::invalid_params(format!("add: expected int, got {}", arg.value_type())))?;
            sum = sum
                .checked_add(n)
                .ok_or_else(|| Fault::application("add: overflow"))?;
        }
        Ok(Value::Int(sum))
    }
}
