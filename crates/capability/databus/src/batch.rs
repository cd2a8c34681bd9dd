//! 批量更新与补偿式事务
//!
//! 两者都在调用方任务中顺序执行。
//!
//! `transaction` 不是原子的：每步执行前先算出补偿操作，失败时按逆序执行补偿。
//! 补偿写入会产生新版本号，补偿本身失败只记录日志并计数。

use crate::error::DataBusError;
use crate::facade::DataBus;
use domain::keys::{device_key, order_key, port_key, protocol_key, state_key};
use domain::{DeviceData, DeviceState, Entity, OrderData, PortData, ProtocolData};
use tracing::{error, info, warn};

/// 单个数据操作
#[derive(Debug, Clone, PartialEq)]
pub enum DataOperation {
    SetDevice(DeviceData),
    DeleteDevice(String),
    SetState(DeviceState),
    DeleteState(String),
    SetPort(PortData),
    DeletePort { device_id: String, port_number: u32 },
    SetOrder(OrderData),
    DeleteOrder(String),
    SetProtocol(ProtocolData),
    DeleteProtocol { conn_id: u64, message_id: u16 },
}

impl DataOperation {
    /// 操作目标的存储键
    pub fn key(&self) -> String {
        match self {
            Self::SetDevice(device) => device.storage_key(),
            Self::DeleteDevice(device_id) => device_key(device_id),
            Self::SetState(state) => state.storage_key(),
            Self::DeleteState(device_id) => state_key(device_id),
            Self::SetPort(port) => port.storage_key(),
            Self::DeletePort {
                device_id,
                port_number,
            } => port_key(device_id, *port_number),
            Self::SetOrder(order) => order.storage_key(),
            Self::DeleteOrder(order_id) => order_key(order_id),
            Self::SetProtocol(record) => record.storage_key(),
            Self::DeleteProtocol {
                conn_id,
                message_id,
            } => protocol_key(*conn_id, *message_id),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SetDevice(_) => "set_device",
            Self::DeleteDevice(_) => "delete_device",
            Self::SetState(_) => "set_state",
            Self::DeleteState(_) => "delete_state",
            Self::SetPort(_) => "set_port",
            Self::DeletePort { .. } => "delete_port",
            Self::SetOrder(_) => "set_order",
            Self::DeleteOrder(_) => "delete_order",
            Self::SetProtocol(_) => "set_protocol",
            Self::DeleteProtocol { .. } => "delete_protocol",
        }
    }
}

/// 批量更新结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// (操作下标, 错误描述)
    pub errors: Vec<(usize, String)>,
}

/// 事务执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionResult {
    pub applied: usize,
}

impl DataBus {
    /// 顺序执行全部操作，失败不中断；仅当全部失败时返回错误。
    pub async fn batch_update(
        &self,
        operations: Vec<DataOperation>,
    ) -> Result<BatchResult, DataBusError> {
        self.ensure_running()?;
        let mut result = BatchResult {
            total: operations.len(),
            ..BatchResult::default()
        };
        for (idx, operation) in operations.into_iter().enumerate() {
            let name = operation.name();
            match self.apply(operation).await {
                Ok(()) => result.succeeded += 1,
                Err(err) => {
                    warn!(
                        target: "iotgw.databus",
                        index = idx,
                        operation = name,
                        error = %err,
                        "batch_operation_failed"
                    );
                    result.failed += 1;
                    result.errors.push((idx, err.to_string()));
                }
            }
        }
        if result.total > 0 && result.failed == result.total {
            let first_error = result
                .errors
                .first()
                .map(|(_, err)| err.clone())
                .unwrap_or_default();
            return Err(DataBusError::PartialFailure {
                total: result.total,
                failed: result.failed,
                first_error,
            });
        }
        info!(
            target: "iotgw.databus",
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            "batch_update_finished"
        );
        Ok(result)
    }

    /// 补偿式事务：任一步失败时按逆序执行已完成步骤的补偿操作。
    pub async fn transaction(
        &self,
        operations: Vec<DataOperation>,
    ) -> Result<TransactionResult, DataBusError> {
        self.ensure_running()?;
        let mut compensations: Vec<DataOperation> = Vec::with_capacity(operations.len());
        for (step, operation) in operations.into_iter().enumerate() {
            let compensation = match self.compensation_for(&operation).await {
                Ok(compensation) => compensation,
                Err(err) => return Err(self.roll_back(step, err, compensations).await),
            };
            if let Err(err) = self.apply(operation).await {
                return Err(self.roll_back(step, err, compensations).await);
            }
            compensations.push(compensation);
        }
        Ok(TransactionResult {
            applied: compensations.len(),
        })
    }

    async fn roll_back(
        &self,
        step: usize,
        cause: DataBusError,
        compensations: Vec<DataOperation>,
    ) -> DataBusError {
        warn!(
            target: "iotgw.databus",
            step,
            error = %cause,
            pending = compensations.len(),
            "transaction_rolling_back"
        );
        let mut rolled_back = 0;
        let mut rollback_failures = 0;
        for compensation in compensations.into_iter().rev() {
            let key = compensation.key();
            match self.apply(compensation).await {
                Ok(()) => rolled_back += 1,
                Err(err) => {
                    rollback_failures += 1;
                    error!(
                        target: "iotgw.databus",
                        key = %key,
                        error = %err,
                        "transaction_rollback_failed"
                    );
                }
            }
        }
        DataBusError::TransactionFailed {
            step,
            reason: cause.to_string(),
            rolled_back,
            rollback_failures,
        }
    }

    /// 执行前计算补偿：写入前有旧值则恢复旧值，否则删除；删除已有值则恢复。
    async fn compensation_for(
        &self,
        operation: &DataOperation,
    ) -> Result<DataOperation, DataBusError> {
        let key = operation.key();
        let compensation = match operation {
            DataOperation::SetDevice(device) => match self.devices.get(&key).await? {
                Some(old) => DataOperation::SetDevice(old),
                None => DataOperation::DeleteDevice(device.device_id.clone()),
            },
            DataOperation::DeleteDevice(device_id) => match self.devices.get(&key).await? {
                Some(old) => DataOperation::SetDevice(old),
                None => DataOperation::DeleteDevice(device_id.clone()),
            },
            DataOperation::SetState(state) => match self.states.manager().get(&key).await? {
                Some(old) => DataOperation::SetState(old),
                None => DataOperation::DeleteState(state.device_id.clone()),
            },
            DataOperation::DeleteState(device_id) => {
                match self.states.manager().get(&key).await? {
                    Some(old) => DataOperation::SetState(old),
                    None => DataOperation::DeleteState(device_id.clone()),
                }
            }
            DataOperation::SetPort(port) => match self.ports.get(&key).await? {
                Some(old) => DataOperation::SetPort(old),
                None => DataOperation::DeletePort {
                    device_id: port.device_id.clone(),
                    port_number: port.port_number,
                },
            },
            DataOperation::DeletePort {
                device_id,
                port_number,
            } => match self.ports.get(&key).await? {
                Some(old) => DataOperation::SetPort(old),
                None => DataOperation::DeletePort {
                    device_id: device_id.clone(),
                    port_number: *port_number,
                },
            },
            DataOperation::SetOrder(order) => match self.orders.get_order(&order.order_id).await? {
                Some(old) => DataOperation::SetOrder(old),
                None => DataOperation::DeleteOrder(order.order_id.clone()),
            },
            DataOperation::DeleteOrder(order_id) => match self.orders.get_order(order_id).await? {
                Some(old) => DataOperation::SetOrder(old),
                None => DataOperation::DeleteOrder(order_id.clone()),
            },
            DataOperation::SetProtocol(record) => match self.protocols.get(&key).await? {
                Some(old) => DataOperation::SetProtocol(old),
                None => DataOperation::DeleteProtocol {
                    conn_id: record.conn_id,
                    message_id: record.message_id,
                },
            },
            DataOperation::DeleteProtocol {
                conn_id,
                message_id,
            } => match self.protocols.get(&key).await? {
                Some(old) => DataOperation::SetProtocol(old),
                None => DataOperation::DeleteProtocol {
                    conn_id: *conn_id,
                    message_id: *message_id,
                },
            },
        };
        Ok(compensation)
    }

    /// 执行单个操作；写入走与 publish_* 相同的路径（含事件），删除不存在的键视为成功。
    async fn apply(&self, operation: DataOperation) -> Result<(), DataBusError> {
        match operation {
            DataOperation::SetDevice(device) => {
                self.publish_device_data(device).await?;
            }
            DataOperation::DeleteDevice(device_id) => {
                ignore_missing(self.delete_device_data(&device_id).await)?;
            }
            DataOperation::SetState(state) => {
                self.publish_device_state(state, "batch").await?;
            }
            DataOperation::DeleteState(device_id) => {
                self.states.delete_state(&device_id).await?;
            }
            DataOperation::SetPort(port) => {
                self.publish_port_data(port).await?;
            }
            DataOperation::DeletePort {
                device_id,
                port_number,
            } => {
                ignore_missing(self.delete_port_data(&device_id, port_number).await)?;
            }
            DataOperation::SetOrder(order) => {
                self.publish_order_data(order).await?;
            }
            DataOperation::DeleteOrder(order_id) => {
                ignore_missing(self.delete_order_data(&order_id).await)?;
            }
            DataOperation::SetProtocol(record) => {
                self.publish_protocol_data(record).await?;
            }
            DataOperation::DeleteProtocol {
                conn_id,
                message_id,
            } => {
                ignore_missing(self.delete_protocol_data(conn_id, message_id).await)?;
            }
        }
        Ok(())
    }
}

fn ignore_missing<T>(result: Result<T, DataBusError>) -> Result<(), DataBusError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}
