//! Container naming and write policy.
//!
//! Container names follow the `{tenant}_{category}` convention. The category
//! determines the container's write policy and its file-bucket assignment
//! (see the offer crate's bucket topology).

/// Parsed container address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerAddress {
    pub tenant: u32,
    pub category: String,
}

impl ContainerAddress {
    /// Parse a `{tenant}_{category}` container name.
    pub fn parse(container: &str) -> crate::Result<Self> {
        let (tenant, category) = container
            .split_once('_')
            .ok_or_else(|| crate::Error::InvalidContainer(container.to_string()))?;
        let tenant: u32 = tenant
            .parse()
            .map_err(|_| crate::Error::InvalidContainer(container.to_string()))?;
        if category.is_empty()
            || !category
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(crate::Error::InvalidContainer(container.to_string()));
        }
        Ok(Self {
            tenant,
            category: category.to_string(),
        })
    }

    pub fn name(&self) -> String {
        format!("{}_{}", self.tenant, self.category)
    }
}
